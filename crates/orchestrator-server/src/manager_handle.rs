//! Breaks the construction cycle between the Session Manager and the
//! Client WS Hub: the manager takes its `EventSink` (the hub) by value at
//! construction, but the hub's manager-API-token auth path and message
//! dispatch both need the manager. `main` builds a `ManagerHandle` first,
//! hands it to the hub, constructs the manager with the hub as its sink,
//! then fills the handle in — mirroring the forward-declared channel ends
//! ccswarm wires up between its coordinator and orchestrator at startup.

use std::sync::{Arc, OnceLock};

use orchestrator_core::manager::SessionManager;

pub struct ManagerHandle(OnceLock<Arc<SessionManager>>);

impl ManagerHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(OnceLock::new()))
    }

    pub fn set(&self, manager: Arc<SessionManager>) {
        let _ = self.0.set(manager);
    }

    pub fn get(&self) -> &Arc<SessionManager> {
        self.0.get().expect("ManagerHandle read before main() called set()")
    }
}
