//! In-process coordination store
//!
//! Backs tests and the simulation binary. Every node gets its own
//! [`StoreSession`] over one shared tree, so ephemeral ownership, session
//! expiry and watch delivery behave like a real coordination service.

use crate::common::{Error, Result};
use crate::coordinator::store::{
    CoordinationStore, CreateMode, Stat, Watch, WatchEvent, WatchEventKind, SEQUENCE_WIDTH,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct ZNode {
    data: Vec<u8>,
    version: u32,
    owner: Option<u64>,
    next_sequence: u64,
}

struct Watcher {
    path: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Watcher {
    fn covers(&self, path: &str) -> bool {
        self.path == "/"
            || path == self.path
            || (path.starts_with(&self.path) && path.as_bytes().get(self.path.len()) == Some(&b'/'))
    }
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, ZNode>,
    watchers: Vec<Watcher>,
    closed_sessions: HashSet<u64>,
    pending_failures: u32,
}

impl Tree {
    fn check_session(&mut self, session: u64) -> Result<()> {
        if self.closed_sessions.contains(&session) {
            return Err(Error::SessionExpired(session));
        }
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(Error::Store("injected transient failure".into()));
        }
        Ok(())
    }

    fn notify(&mut self, path: &str, kind: WatchEventKind) {
        self.watchers.retain(|w| {
            if !w.covers(path) {
                return !w.tx.is_closed();
            }
            w.tx
                .send(WatchEvent {
                    path: path.to_string(),
                    kind,
                })
                .is_ok()
        });
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    fn stat(&self, path: &str, node: &ZNode) -> Stat {
        Stat {
            version: node.version,
            ephemeral_owner: node.owner,
            num_children: self.child_names(path).len(),
        }
    }

    fn remove_session(&mut self, session: u64) -> Vec<String> {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for path in &owned {
            self.nodes.remove(path);
        }
        owned
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(Error::Store(format!("invalid path: {:?}", path)));
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Shared tree; hand out one session per node.
#[derive(Clone)]
pub struct MemStore {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
}

impl MemStore {
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.nodes.insert(
            "/".to_string(),
            ZNode {
                data: Vec::new(),
                version: 0,
                owner: None,
                next_sequence: 0,
            },
        );
        Self {
            tree: Arc::new(Mutex::new(tree)),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new client session.
    pub fn session(&self) -> StoreSession {
        StoreSession {
            tree: self.tree.clone(),
            id: self.next_session.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn inject_failures(&self, n: u32) {
        self.tree.lock().pending_failures = n;
    }

    /// Expire a session from the server side, as after a network partition.
    pub fn expire_session(&self, session: u64) {
        let mut tree = self.tree.lock();
        tree.closed_sessions.insert(session);
        for path in tree.remove_session(session) {
            tree.notify(&path, WatchEventKind::Deleted);
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's session on a [`MemStore`].
pub struct StoreSession {
    tree: Arc<Mutex<Tree>>,
    id: u64,
}

impl CoordinationStore for StoreSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;

        let parent = parent_of(path).to_string();
        let parent_node = tree
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| Error::NoNode(parent.clone()))?;
        if parent_node.owner.is_some() {
            return Err(Error::Store(format!("ephemeral node {} cannot have children", parent)));
        }

        let actual = if mode.is_sequential() {
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{}{:0width$}", path, seq, width = SEQUENCE_WIDTH)
        } else {
            path.to_string()
        };
        if tree.nodes.contains_key(&actual) {
            return Err(Error::NodeExists(actual));
        }

        tree.nodes.insert(
            actual.clone(),
            ZNode {
                data: data.to_vec(),
                version: 0,
                owner: mode.is_ephemeral().then_some(self.id),
                next_sequence: 0,
            },
        );
        tree.notify(&actual, WatchEventKind::Created);
        Ok(actual)
    }

    fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        Ok((node.data.clone(), tree.stat(path, node)))
    }

    fn exists(&self, path: &str) -> Result<Option<Stat>> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        Ok(tree.nodes.get(path).map(|node| tree.stat(path, node)))
    }

    fn set(&self, path: &str, data: &[u8], expected_version: Option<u32>) -> Result<Stat> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data.to_vec();
        node.version += 1;
        let version = node.version;
        let owner = node.owner;
        tree.notify(path, WatchEventKind::DataChanged);
        Ok(Stat {
            version,
            ephemeral_owner: owner,
            num_children: tree.child_names(path).len(),
        })
    }

    fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<()> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        if !tree.child_names(path).is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }
        tree.nodes.remove(path);
        tree.notify(path, WatchEventKind::Deleted);
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        Ok(tree.child_names(path))
    }

    fn watch(&self, path: &str) -> Result<Watch> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tree.watchers.push(Watcher {
            path: path.to_string(),
            tx,
        });
        Ok(Watch::new(path, rx))
    }

    fn close(&self) -> Result<()> {
        let mut tree = self.tree.lock();
        if !tree.closed_sessions.insert(self.id) {
            return Ok(());
        }
        for path in tree.remove_session(self.id) {
            tree.notify(&path, WatchEventKind::Deleted);
        }
        Ok(())
    }
}
