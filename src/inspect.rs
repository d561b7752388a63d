//! Read-only listings of store contents for the `show` command.

use std::fmt::Write;
use std::net::Ipv4Addr;

use chrono::DateTime;

use crate::error::Result;
use crate::store::{POOL_KEY, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    Groups,
    Clients,
    Mac,
    Pool,
}

/// Renders one listing as printable text.
pub async fn render(store: &dyn Store, listing: Listing) -> Result<String> {
    match listing {
        Listing::Groups => render_hashes(store, "DHCP groups", "group:").await,
        Listing::Clients => render_hashes(store, "DHCP clients", "client:").await,
        Listing::Mac => render_bindings(store).await,
        Listing::Pool => render_pool(store).await,
    }
}

async fn render_hashes(store: &dyn Store, title: &str, prefix: &str) -> Result<String> {
    let mut out = format!("{}:\n\n", title);
    for key in store.keys(prefix).await? {
        let mut fields: Vec<_> = store.get_all(&key).await?.into_iter().collect();
        fields.sort();

        let _ = writeln!(out, "{}", key);
        for (field, value) in fields {
            let _ = writeln!(out, "  {} = {}", field, value);
        }
        out.push('\n');
    }
    Ok(out)
}

async fn render_bindings(store: &dyn Store) -> Result<String> {
    let mut out = String::from("DHCP by Ethernet address:\n\n");
    for key in store.keys("mac:").await? {
        let fields = store.get_all(&key).await?;
        let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or_default();

        let _ = write!(out, "  {}  {:<16}", key, field("ip"));
        out.push_str(if field("dynamic") == "1" { "* " } else { "  " });

        let seen = field("ts")
            .parse::<i64>()
            .ok()
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        match seen {
            Some(seen) => {
                let _ = write!(out, "  {}", seen.format("%Y-%m-%d %H:%M:%S"));
            }
            None => out.push_str(&" ".repeat(21)),
        }

        if !field("description").is_empty() {
            let _ = write!(out, "  {}", field("description"));
        }
        if !field("group").is_empty() {
            let _ = write!(out, "  (group:{})", field("group"));
        }
        out.push('\n');
    }
    Ok(out)
}

async fn render_pool(store: &dyn Store) -> Result<String> {
    let mut entries: Vec<_> = store.get_all(POOL_KEY).await?.into_iter().collect();
    entries.sort_by_key(|(ip, _)| ip.parse::<Ipv4Addr>().map(u32::from).unwrap_or(u32::MAX));

    let free = entries.iter().filter(|(_, owner)| owner.is_empty()).count();
    let mut out = format!("Dynamic pool: {} entries, {} free\n\n", entries.len(), free);
    for (ip, owner) in entries {
        let owner = if owner.is_empty() { "-" } else { owner.as_str() };
        let _ = writeln!(out, "  {:<16} {}", ip, owner);
    }
    Ok(out)
}
