use dashmap::DashMap;
use rgfx_protocol::RemoteId;

use crate::handle::Handle;

/// Bidirectional mapping between local handles and remote ids.
/// Owned by the connection layer on the client: capture translates local
/// handles on every record, responses that name remote ids map back.
pub struct HandleMap {
    /// Local handle -> RemoteId
    local_to_remote: DashMap<Handle, RemoteId>,
    /// RemoteId -> Local handle
    remote_to_local: DashMap<RemoteId, Handle>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self {
            local_to_remote: DashMap::new(),
            remote_to_local: DashMap::new(),
        }
    }

    /// Register a 1:1 pair. Invalid ids are ignored and return false.
    pub fn insert(&self, local: Handle, remote: RemoteId) -> bool {
        if !local.is_valid() || !remote.is_valid() {
            return false;
        }
        self.local_to_remote.insert(local, remote);
        self.remote_to_local.insert(remote, local);
        true
    }

    /// Look up a remote id by local handle.
    pub fn to_remote(&self, local: Handle) -> Option<RemoteId> {
        self.local_to_remote.get(&local).map(|v| *v)
    }

    /// Look up a local handle by remote id.
    pub fn to_local(&self, remote: &RemoteId) -> Option<Handle> {
        self.remote_to_local.get(remote).map(|v| *v)
    }

    /// Remove a pair by local handle.
    pub fn remove_by_local(&self, local: Handle) -> Option<RemoteId> {
        if let Some((_, remote)) = self.local_to_remote.remove(&local) {
            self.remote_to_local.remove(&remote);
            Some(remote)
        } else {
            None
        }
    }

    /// Remove a pair by remote id.
    pub fn remove_by_remote(&self, remote: &RemoteId) -> Option<Handle> {
        if let Some((_, local)) = self.remote_to_local.remove(remote) {
            self.local_to_remote.remove(&local);
            Some(local)
        } else {
            None
        }
    }

    /// Drop every pair, returning what was mapped.
    pub fn drain(&self) -> Vec<(Handle, RemoteId)> {
        let pairs: Vec<(Handle, RemoteId)> =
            self.local_to_remote.iter().map(|e| (*e.key(), *e.value())).collect();
        self.local_to_remote.clear();
        self.remote_to_local.clear();
        pairs
    }

    /// Return number of mapped handles.
    pub fn len(&self) -> usize {
        self.local_to_remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_to_remote.is_empty()
    }
}

impl Default for HandleMap {
    fn default() -> Self {
        Self::new()
    }
}
