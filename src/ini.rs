//! Minimal INI handling for Ansible inventories, session files and server
//! backups. Keys keep their case and may have no value.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    pub name: String,
    /// Entry lines as written, e.g. `srv-a1` or `Host=10.0.0.1`.
    pub entries: Vec<String>,
}

impl Section {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    /// Value of `key` in a `key=value` or `key = value` entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|entry| {
            let (name, value) = split_entry(entry);
            if name == key {
                value
            } else {
                None
            }
        })
    }

    /// Replaces the `key` entry, keeping its position, or appends it.
    pub fn set(&mut self, key: &str, value: &str) {
        let line = format!("{}={}", key, value);
        match self
            .entries
            .iter_mut()
            .find(|entry| split_entry(entry).0 == key)
        {
            Some(entry) => *entry = line,
            None => self.entries.push(line),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ini {
    pub sections: Vec<Section>,
}

impl Ini {
    pub fn parse(text: &str) -> Self {
        let mut sections: Vec<Section> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                sections.push(Section::new(line[1..line.len() - 1].trim()));
                continue;
            }
            // Entries before the first header are dropped.
            if let Some(section) = sections.last_mut() {
                section.entries.push(line.to_string());
            }
        }

        return Self { sections };
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        let index = match self.sections.iter().position(|section| section.name == name) {
            Some(index) => index,
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[index]
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|section| section.get(key))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("[{}]\n", section.name));
            for entry in &section.entries {
                out.push_str(entry);
                out.push('\n');
            }
            out.push('\n');
        }

        return out;
    }
}

fn split_entry(entry: &str) -> (&str, Option<&str>) {
    match entry.split_once('=') {
        Some((key, value)) => (key.trim(), Some(value.trim())),
        None => (entry.trim(), None),
    }
}
