//! Filters deciding which Node watch events wake which controller.

use k8s_openapi::api::core::v1::Node;

pub fn name_matches(node: &Node, node_name: &str) -> bool {
    node.metadata.name.as_deref() == Some(node_name)
}

/// Allocatable or capacity resources differ. A node seen for the first time counts as changed.
pub fn resources_changed(previous: Option<&Node>, current: &Node) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    let resources = |node: &Node| {
        node.status
            .as_ref()
            .map(|status| (status.allocatable.clone(), status.capacity.clone()))
    };
    resources(previous) != resources(current)
}

/// Annotations differ. A node seen for the first time counts as changed.
pub fn annotations_changed(previous: Option<&Node>, current: &Node) -> bool {
    previous.is_none_or(|previous| previous.metadata.annotations != current.metadata.annotations)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn node(
        name: &str,
        annotations: &[(&str, &str)],
        allocatable: &[(&str, &str)],
        capacity: &[(&str, &str)],
    ) -> Node {
        let quantities = |items: &[(&str, &str)]| {
            items
                .iter()
                .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                .collect::<BTreeMap<_, _>>()
        };
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            status: Some(NodeStatus {
                allocatable: Some(quantities(allocatable)),
                capacity: Some(quantities(capacity)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn name_must_match_exactly() {
        let n = node("gpu-node-1", &[], &[], &[]);
        assert!(name_matches(&n, "gpu-node-1"));
        assert!(!name_matches(&n, "gpu-node-10"));
    }

    #[test]
    fn capacity_change_alone_wakes_the_reporter() {
        let before = node("n", &[], &[("nvidia.com/mig-1g.10gb", "2")], &[("nvidia.com/mig-1g.10gb", "2")]);
        let after = node("n", &[], &[("nvidia.com/mig-1g.10gb", "2")], &[("nvidia.com/mig-1g.10gb", "3")]);
        assert!(resources_changed(Some(&before), &after));
        assert!(!resources_changed(Some(&before), &before.clone()));
        assert!(resources_changed(None, &before));
    }

    #[test]
    fn annotation_change_wakes_the_actuator() {
        let before = node("n", &[("n8s.nebuly.ai/spec-gpu-0-1g.10gb", "1")], &[], &[]);
        let after = node("n", &[("n8s.nebuly.ai/spec-gpu-0-1g.10gb", "2")], &[], &[]);
        assert!(annotations_changed(Some(&before), &after));
        assert!(!annotations_changed(Some(&after), &after.clone()));
        assert!(!resources_changed(Some(&before), &after));
    }
}
