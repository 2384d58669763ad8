//! Checks of the custom resources against manifests as an operator writes them

use kube::CustomResourceExt;
use system_registry_orchestrator::constants::ModeType;
use system_registry_orchestrator::crd::{ModuleConfig, UserOperation, UserOperationType};
use system_registry_orchestrator::orchestrator::{ModeParams, Params};

const MODULE_CONFIG: &str = r#"
apiVersion: deckhouse.io/v1alpha1
kind: ModuleConfig
metadata:
  name: system-registry
  generation: 5
spec:
  enabled: true
  version: 1
  settings:
    mode: Proxy
    proxy:
      host: registry.example.com
      path: /deckhouse/ee
      scheme: HTTPS
      user: puller
      password: secret
      ttl: 72h
"#;

#[test]
fn module_config_manifest_yields_proxy_params() {
    let mc: ModuleConfig = serde_yaml::from_str(MODULE_CONFIG).unwrap();
    assert!(mc.spec.is_enabled());

    let params = Params::from_settings(&mc.spec.settings, mc.metadata.generation.unwrap()).unwrap();
    assert_eq!(params.generation, 5);
    assert_eq!(params.mode(), ModeType::Proxy);

    let ModeParams::Proxy(proxy) = params.mode else {
        panic!("expected proxy params");
    };
    assert_eq!(proxy.upstream.images_repo, "registry.example.com/deckhouse/ee");
    assert_eq!(proxy.upstream.scheme, "https");
    assert_eq!(proxy.ttl.as_deref(), Some("72h"));
}

#[test]
fn user_operation_crd_is_cluster_scoped_with_status() {
    let crd = UserOperation::crd();
    assert_eq!(crd.spec.group, "deckhouse.io");
    assert_eq!(crd.spec.names.kind, "UserOperation");
    assert_eq!(crd.spec.names.plural, "useroperations");
    assert_eq!(crd.spec.scope, "Cluster");

    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1");
    assert!(version
        .subresources
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .is_some());
}

#[test]
fn user_operation_manifest_decodes() {
    let op: UserOperation = serde_yaml::from_str(
        r#"
apiVersion: deckhouse.io/v1
kind: UserOperation
metadata:
  name: reset-alice
spec:
  user: alice
  type: Reset2FA
  initiatorType: admin
"#,
    )
    .unwrap();
    assert_eq!(op.spec.type_, UserOperationType::Reset2Fa);
    assert!(op.status.is_none());

    let unknown = serde_yaml::from_str::<UserOperation>(
        r#"
apiVersion: deckhouse.io/v1
kind: UserOperation
metadata:
  name: bad
spec:
  user: alice
  type: Delete
"#,
    );
    assert!(unknown.is_err());
}
