//! Navigation sidebar.
//!
//! # Responsibilities
//! - Collect sidebar items from every registered provider
//! - Attach items under their parent and order siblings
//! - Drop items the current user lacks permission for
//! - Search leaf items for the navbox
//!
//! Items name their parent with `attach`; the core plugin contributes the
//! top-level categories. Items attached to an unknown parent land at the
//! root.

use serde::{Deserialize, Serialize};

/// One node of the sidebar tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SidebarItem {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
    pub url: Option<String>,
    /// Id of the parent item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach: Option<String>,
    pub weight: i32,
    /// Permission required to see this item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    pub children: Vec<SidebarItem>,
}

impl SidebarItem {
    pub fn category(id: &str, name: &str, weight: i32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            weight,
            ..Default::default()
        }
    }
}

/// Contributes items to the sidebar.
pub trait SidebarProvider: Send + Sync {
    fn items(&self) -> Vec<SidebarItem>;
}

/// Assemble the tree from flat `items`, keeping only permitted entries.
pub fn build<F>(items: Vec<SidebarItem>, allowed: F) -> SidebarItem
where
    F: Fn(&str) -> bool,
{
    let mut root = SidebarItem::category("root", "", 0);
    let (mut pending, mut rest): (Vec<_>, Vec<_>) =
        items.into_iter().partition(|item| item.attach.is_none());
    root.children.append(&mut pending);

    // Attach in passes so children may arrive before their parents.
    loop {
        let before = rest.len();
        let mut unattached = Vec::new();
        for item in rest {
            let parent = item.attach.clone().unwrap_or_default();
            match find_mut(&mut root, &parent) {
                Some(node) => node.children.push(item),
                None => unattached.push(item),
            }
        }
        rest = unattached;
        if rest.is_empty() || rest.len() == before {
            break;
        }
    }
    for orphan in rest {
        tracing::debug!(item = %orphan.id, "Sidebar item attached to unknown parent");
        root.children.push(orphan);
    }

    prune(&mut root, &allowed);
    sort(&mut root);
    root
}

fn find_mut<'a>(node: &'a mut SidebarItem, id: &str) -> Option<&'a mut SidebarItem> {
    if node.id == id {
        return Some(node);
    }
    node.children.iter_mut().find_map(|child| find_mut(child, id))
}

fn prune<F: Fn(&str) -> bool>(node: &mut SidebarItem, allowed: &F) {
    node.children.retain(|child| {
        child
            .permission
            .as_deref()
            .map_or(true, |permission| allowed(permission))
    });
    for child in &mut node.children {
        prune(child, allowed);
    }
    // Categories left without entries disappear.
    node.children
        .retain(|child| child.url.is_some() || !child.children.is_empty());
}

fn sort(node: &mut SidebarItem) {
    node.children
        .sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.name.cmp(&b.name)));
    for child in &mut node.children {
        sort(child);
    }
}

/// Leaf items whose name contains `query`, case-insensitively.
pub fn search(root: &SidebarItem, query: &str) -> Vec<SidebarItem> {
    let query = query.to_lowercase();
    let mut found = Vec::new();
    collect(root, &query, &mut found);
    found
}

fn collect(node: &SidebarItem, query: &str, found: &mut Vec<SidebarItem>) {
    for child in &node.children {
        if child.url.is_some() && child.name.to_lowercase().contains(query) {
            found.push(SidebarItem {
                children: Vec::new(),
                ..child.clone()
            });
        }
        collect(child, query, found);
    }
}
