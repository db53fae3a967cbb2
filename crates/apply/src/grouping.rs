//! The grouping object: a ConfigMap that records which identifiers an
//! applied set contained, so a later prune pass knows what to remove.

use crate::error::EngineError;
use crate::manifest::Manifest;
use berth_core::ObjId;
use serde_json::{Map, Value as Json};
use tracing::warn;

/// Manifests carrying this label are grouping-object templates; its value
/// ties grouping objects of successive runs of the same set together.
pub const GROUPING_LABEL: &str = "berth.dev/set-id";

/// A prior grouping object found in the cluster: its own identifier plus the
/// identifier set it recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorGroup {
    pub id: ObjId,
    pub contents: Vec<ObjId>,
}

/// Everything a prune pass needs to know about earlier applies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorState {
    pub groups: Vec<PriorGroup>,
}

pub fn is_grouping(manifest: &Manifest) -> bool {
    manifest.label(GROUPING_LABEL).is_some()
}

/// Splits an input set into ordinary resources and grouping templates.
pub fn split_manifests(manifests: Vec<Manifest>) -> (Vec<Manifest>, Vec<Manifest>) {
    manifests.into_iter().partition(|m| !is_grouping(m))
}

/// Picks the single grouping template out of an input set. Zero or more than
/// one template is a fatal input error; the latter names the conflicts.
pub fn single_template(mut templates: Vec<Manifest>) -> Result<Manifest, EngineError> {
    match templates.len() {
        1 => Ok(templates.remove(0)),
        0 => Err(EngineError::Input("no grouping object template in applied set".into())),
        _ => {
            let names: Vec<String> = templates.iter().map(|m| m.id.to_string()).collect();
            Err(EngineError::Input(format!(
                "multiple grouping object templates in applied set: {}",
                names.join(", ")
            )))
        }
    }
}

/// Fills the template's data map with one key per recorded identifier
/// (rendered text form, empty value) and returns the manifest to apply.
pub fn build_grouping_object(
    template: Manifest,
    resources: &[Manifest],
) -> Result<Manifest, EngineError> {
    if template.id.kind != "ConfigMap" {
        return Err(EngineError::Input(format!(
            "grouping object template {} must be a ConfigMap, got {}",
            template.id, template.id.kind
        )));
    }
    if template.id.namespace.is_empty() {
        return Err(EngineError::Input(format!(
            "grouping object template {} must carry a namespace",
            template.id
        )));
    }

    let mut raw = template.raw;
    let mut data = Map::new();
    for resource in resources {
        data.insert(resource.id.to_string(), Json::String(String::new()));
    }
    match raw.as_object_mut() {
        Some(obj) => {
            obj.insert("data".to_string(), Json::Object(data));
        }
        None => return Err(EngineError::Input("grouping template is not an object".into())),
    }
    Ok(Manifest { id: template.id, api_version: template.api_version, raw })
}

/// Parses the recorded identifier set out of a grouping ConfigMap's data
/// keys. Malformed keys are skipped with a warning rather than failing the
/// whole prune pass.
pub fn parse_grouping_contents(grouping_id: &ObjId, data_keys: &[String]) -> Vec<ObjId> {
    let mut contents = Vec::with_capacity(data_keys.len());
    for key in data_keys {
        match key.parse::<ObjId>() {
            Ok(id) => contents.push(id),
            Err(e) => {
                warn!(grouping = %grouping_id, key = %key, error = %e, "skipping malformed grouping entry");
            }
        }
    }
    contents
}

/// All namespaced manifests in one applied set must share a namespace.
pub fn validate_single_namespace(manifests: &[Manifest]) -> Result<(), EngineError> {
    let mut seen: Option<&str> = None;
    for m in manifests {
        if m.id.namespace.is_empty() {
            continue;
        }
        match seen {
            None => seen = Some(&m.id.namespace),
            Some(ns) if ns != m.id.namespace => {
                return Err(EngineError::Input(format!(
                    "objects have differing namespaces: {} and {}",
                    ns, m.id.namespace
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(name: &str, ns: &str) -> Manifest {
        Manifest::from_json(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": ns}
        }))
        .unwrap()
    }

    fn template(name: &str) -> Manifest {
        Manifest::from_json(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": "default",
                "labels": {(GROUPING_LABEL): "demo"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn split_separates_templates_from_resources() {
        let (resources, templates) =
            split_manifests(vec![resource("a", "default"), template("group"), resource("b", "default")]);
        assert_eq!(resources.len(), 2);
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].id.name, "group");
    }

    #[test]
    fn zero_templates_is_an_input_error() {
        assert!(matches!(single_template(vec![]), Err(EngineError::Input(_))));
    }

    #[test]
    fn multiple_templates_error_names_both() {
        let err = single_template(vec![template("one"), template("two")]).unwrap_err();
        match err {
            EngineError::Input(msg) => {
                assert!(msg.contains("one"), "{msg}");
                assert!(msg.contains("two"), "{msg}");
            }
            other => panic!("expected Input error, got {other:?}"),
        }
    }

    #[test]
    fn build_records_resource_identifiers_as_data_keys() {
        let resources = vec![resource("a", "default"), resource("b", "default")];
        let grouping = build_grouping_object(template("group"), &resources).unwrap();
        let data = grouping.raw.pointer("/data").unwrap().as_object().unwrap();
        assert_eq!(data.len(), 2);
        assert!(data.contains_key("default_a_apps_Deployment"));
        assert!(data.contains_key("default_b_apps_Deployment"));
    }

    #[test]
    fn build_rejects_non_configmap_template() {
        let mut odd = template("group");
        odd.id.kind = "Secret".into();
        assert!(matches!(build_grouping_object(odd, &[]), Err(EngineError::Input(_))));
    }

    #[test]
    fn parse_contents_skips_malformed_keys() {
        let grouping_id = ObjId::new("", "ConfigMap", "default", "group").unwrap();
        let keys = vec![
            "default_a_apps_Deployment".to_string(),
            "not-an-identifier".to_string(),
        ];
        let contents = parse_grouping_contents(&grouping_id, &keys);
        assert_eq!(contents, vec![ObjId::new("apps", "Deployment", "default", "a").unwrap()]);
    }

    #[test]
    fn namespace_validation_ignores_cluster_scoped() {
        let mut role = resource("admin", "");
        role.id.kind = "ClusterRole".into();
        assert!(validate_single_namespace(&[role, resource("a", "default")]).is_ok());
        assert!(matches!(
            validate_single_namespace(&[resource("a", "default"), resource("b", "prod")]),
            Err(EngineError::Input(_))
        ));
    }
}
