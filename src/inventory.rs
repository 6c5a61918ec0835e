use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::ini::Ini;
use crate::sheet::Host;
use crate::writer::{self, write_atomic};

pub const INVENTORY_PREFIX: &str = "production_";

/// The hosts template is plain INI with value-less entries.
pub type HostsTemplate = Ini;

/// Inventory per market, built on top of the hosts template sections.
pub fn build(template: &Ini, hosts: &[Host]) -> BTreeMap<String, Ini> {
    let has_submarkets = hosts.iter().any(|host| host.submarket.is_some());
    let mut markets: BTreeMap<&str, Vec<&Host>> = BTreeMap::new();
    for host in hosts {
        if host.market.is_empty() {
            tracing::warn!("{} has no market, leaving it out of the inventory", host.name);
            continue;
        }
        markets.entry(host.market.as_str()).or_default().push(host);
    }

    let mut inventories = BTreeMap::new();
    for (market, members) in markets {
        let mut inventory = template.clone();

        for host in &members {
            for server_type in &host.server_types {
                inventory
                    .section_mut(&server_type.to_uppercase())
                    .entries
                    .push(host.name.clone());
            }
        }

        if has_submarkets {
            let submarkets: BTreeSet<&str> = members
                .iter()
                .filter_map(|host| host.submarket.as_deref())
                .collect();
            inventory.section_mut(&format!("{}:children", market)).entries =
                submarkets.iter().map(|submarket| submarket.to_string()).collect();

            for host in &members {
                let section = host.submarket.as_deref().unwrap_or(market);
                inventory.section_mut(section).entries.push(host.name.clone());
            }
        } else {
            inventory.section_mut(market).entries =
                members.iter().map(|host| host.name.clone()).collect();
        }

        tracing::debug!("{} inventory: {:?}", market, inventory);
        inventories.insert(market.to_string(), inventory);
    }

    return inventories;
}

/// Sections sorted by name and entries sorted, one blank line after each.
pub fn render(inventory: &Ini) -> String {
    let mut sorted = inventory.clone();
    sorted.sections.sort_by(|a, b| a.name.cmp(&b.name));
    for section in &mut sorted.sections {
        section.entries.sort();
        section.entries.dedup();
    }

    return sorted.render();
}

pub fn write_inventories(
    dir: &Path,
    inventories: &BTreeMap<String, Ini>,
) -> Result<Vec<PathBuf>, writer::Error> {
    let mut written = Vec::new();
    for (market, inventory) in inventories {
        let path = dir.join(format!("{}{}", INVENTORY_PREFIX, market.to_lowercase()));
        write_atomic(&path, &render(inventory))?;
        written.push(path);
    }

    tracing::info!("Wrote {} inventory files under {}", written.len(), dir.display());
    return Ok(written);
}
