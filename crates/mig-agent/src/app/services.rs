use std::sync::Arc;

use crate::controllers::Actuator;
use crate::controllers::Reporter;
use crate::controllers::SharedState;
use crate::platform::k8s::NodeWatcher;

/// Long-lived components of one node agent, shared with the tasks that run them.
pub struct ApplicationServices {
    pub shared: Arc<SharedState>,
    pub node_watcher: Arc<NodeWatcher>,
    pub reporter: Arc<Reporter>,
    pub actuator: Arc<Actuator>,
}
