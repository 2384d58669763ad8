use super::*;
use crate::orchestrator::pki::GlobalPki;
use crate::orchestrator::testing::{master, MockStaticPodClient};

fn local_params(pki: GlobalPki) -> Params {
    let user = |name: &str| User::generate(name).unwrap();
    Params {
        pki,
        http_secret: "http-secret".to_string(),
        user_ro: user("ro"),
        mode: ModeParams::Local(LocalMode {
            user_rw: user("rw"),
            user_puller: user("mirror-puller"),
            user_pusher: user("mirror-pusher"),
            ingress_client_ca_cert: None,
        }),
    }
}

fn proxy_params(pki: GlobalPki) -> Params {
    Params {
        pki,
        http_secret: "http-secret".to_string(),
        user_ro: User::generate("ro").unwrap(),
        mode: ModeParams::Proxy(ProxyMode {
            upstream: Upstream {
                scheme: "https".to_string(),
                host: "registry.example.com".to_string(),
                path: "/deckhouse/ee".to_string(),
                user: "puller".to_string(),
                password: "secret".to_string(),
                ttl: Some("72h".to_string()),
            },
            upstream_registry_ca_cert: None,
        }),
    }
}

/// Feed the secrets written by the previous pass back as inputs
fn with_applied(inputs: &Inputs, patches: &PatchCollector) -> Inputs {
    let mut next = inputs.clone();
    for m in &mut next.masters {
        if let Some(data) = patches.applied_secret_data(&constants::node_pki_secret_name(&m.name)) {
            m.pki_secret = Some(data);
        }
        if let Some(data) =
            patches.applied_secret_data(&constants::node_config_secret_name(&m.name))
        {
            m.config_secret = Some(data);
        }
    }
    next
}

#[tokio::test]
async fn local_mode_runs_on_first_master_only() {
    let params = local_params(GlobalPki::generate().unwrap());
    let inputs = Inputs {
        masters: vec![master("m2", "10.0.0.2", 200), master("m1", "10.0.0.1", 100)],
    };
    let client = MockStaticPodClient::default();
    let mut state = State::default();
    let mut patches = PatchCollector::new();

    let result = state
        .process(&params, &inputs, &client, &mut patches)
        .await
        .unwrap();

    assert_eq!(client.created_ips(), BTreeSet::from(["10.0.0.1".to_string()]));
    assert_eq!(client.deleted_ips(), BTreeSet::from(["10.0.0.2".to_string()]));
    assert!(state.nodes.contains_key("m1"));
    assert!(!state.nodes.contains_key("m2"));
    assert_eq!(
        patches.applied_secret_names(),
        vec!["registry-node-m1-pki", "registry-node-config-m1"]
    );

    // no static pods yet, m2 already has none
    assert!(!result.is_ready());
    assert!(!result.nodes["m1"].ready);
    assert!(result.nodes["m2"].ready);
}

#[tokio::test]
async fn ready_once_static_pod_reports_config_version() {
    let params = local_params(GlobalPki::generate().unwrap());
    let inputs = Inputs {
        masters: vec![master("m1", "10.0.0.1", 100)],
    };
    let client = MockStaticPodClient::default();
    let mut state = State::default();
    let mut patches = PatchCollector::new();
    state
        .process(&params, &inputs, &client, &mut patches)
        .await
        .unwrap();

    let version = client.created_version("10.0.0.1").unwrap();
    let mut inputs = with_applied(&inputs, &patches);
    inputs.masters[0].static_pod = Some(StaticPodStatus {
        ready: true,
        config_version: version.clone(),
    });

    let mut patches = PatchCollector::new();
    let result = state
        .process(&params, &inputs, &client, &mut patches)
        .await
        .unwrap();

    assert!(result.is_ready(), "{}", result.condition_message());
    assert!(patches.is_empty());
    assert_eq!(client.created_version("10.0.0.1"), Some(version));
}

#[tokio::test]
async fn stale_static_pod_version_is_not_ready() {
    let params = proxy_params(GlobalPki::generate().unwrap());
    let mut inputs = Inputs {
        masters: vec![master("m1", "10.0.0.1", 100)],
    };
    inputs.masters[0].static_pod = Some(StaticPodStatus {
        ready: true,
        config_version: "old".to_string(),
    });
    let client = MockStaticPodClient::default();

    let result = State::default()
        .process(&params, &inputs, &client, &mut PatchCollector::new())
        .await
        .unwrap();

    assert!(!result.is_ready());
    assert!(result.condition_message().contains("m1"));
}

#[tokio::test]
async fn agent_failure_is_isolated_per_node() {
    let params = proxy_params(GlobalPki::generate().unwrap());
    let inputs = Inputs {
        masters: vec![master("m1", "10.0.0.1", 100), master("m2", "10.0.0.2", 200)],
    };
    let client = MockStaticPodClient::failing_on("10.0.0.2");

    let result = State::default()
        .process(&params, &inputs, &client, &mut PatchCollector::new())
        .await
        .unwrap();

    assert_eq!(client.created_ips().len(), 2);
    assert!(result.nodes["m2"].message.contains("unreachable"));
    assert!(!result.nodes["m1"].message.contains("unreachable"));
}

#[tokio::test]
async fn missing_agent_pod_is_reported() {
    let params = proxy_params(GlobalPki::generate().unwrap());
    let mut node = master("m1", "10.0.0.1", 100);
    node.agent_pod_ip = None;
    let client = MockStaticPodClient::default();

    let result = State::default()
        .process(
            &params,
            &Inputs { masters: vec![node] },
            &client,
            &mut PatchCollector::new(),
        )
        .await
        .unwrap();

    assert!(client.calls().is_empty());
    assert_eq!(result.nodes["m1"].message, "static pod agent not found");
}

#[tokio::test]
async fn node_pki_is_reissued_for_a_new_ca() {
    let old = GlobalPki::generate().unwrap();
    let inputs = Inputs {
        masters: vec![master("m1", "10.0.0.1", 100)],
    };
    let client = MockStaticPodClient::default();
    let mut state = State::default();
    let mut patches = PatchCollector::new();
    state
        .process(&proxy_params(old), &inputs, &client, &mut patches)
        .await
        .unwrap();
    let old_node_pki = state.nodes["m1"].clone();

    let new = GlobalPki::generate().unwrap();
    let inputs = with_applied(&inputs, &patches);
    let mut patches = PatchCollector::new();
    state
        .process(&proxy_params(new.clone()), &inputs, &client, &mut patches)
        .await
        .unwrap();

    let node_pki = &state.nodes["m1"];
    assert_ne!(node_pki, &old_node_pki);
    node_pki.validate(&new.ca, "10.0.0.1").unwrap();
    assert_eq!(patches.event_reasons(), vec![EVENT_NODE_PKI_GENERATED]);
}

#[test]
fn node_pki_covers_node_hosts() {
    let global = GlobalPki::generate().unwrap();
    let node = process_node_pki(&global.ca, "m1", "10.0.0.1", None).unwrap();

    node.validate(&global.ca, "10.0.0.1").unwrap();
    assert!(node.validate(&global.ca, "10.0.0.9").is_err());

    let reused = process_node_pki(&global.ca, "m1", "10.0.0.1", Some(&node)).unwrap();
    assert_eq!(reused, node);
}

#[test]
fn config_requires_exactly_one_mode() {
    let global = GlobalPki::generate().unwrap();
    let node = NodePki::generate(&global.ca, "10.0.0.1").unwrap();
    let params = proxy_params(global.clone());

    let rendered = render_config(
        &global,
        &node,
        &params.http_secret,
        &params.user_ro,
        &params.mode,
    )
    .unwrap();
    assert_eq!(rendered.version, compute_hash(&rendered.config).unwrap());

    let mut both = rendered.config.clone();
    let ModeParams::Local(local) = local_params(global.clone()).mode else {
        unreachable!()
    };
    both.local_mode = Some(local);
    assert!(both.validate().is_err());

    let mut neither = rendered.config;
    neither.proxy_mode = None;
    assert!(neither.validate().is_err());
}

#[test]
fn config_rejects_foreign_leaf() {
    let global = GlobalPki::generate().unwrap();
    let foreign = GlobalPki::generate().unwrap();
    let node = NodePki::generate(&foreign.ca, "10.0.0.1").unwrap();
    let params = proxy_params(global.clone());

    let err = render_config(
        &global,
        &node,
        &params.http_secret,
        &params.user_ro,
        &params.mode,
    )
    .unwrap_err();
    assert!(err.is_pki());
}

#[test]
fn first_master_breaks_ties_by_name() {
    let inputs = Inputs {
        masters: vec![master("b", "10.0.0.2", 100), master("a", "10.0.0.1", 100)],
    };
    assert_eq!(inputs.first_master().unwrap().name, "a");
}

#[tokio::test]
async fn stop_removes_everything() {
    let mut with_pod = master("m1", "10.0.0.1", 100);
    with_pod.static_pod = Some(StaticPodStatus::default());
    with_pod.pki_secret = Some(SecretData::new());
    with_pod.config_secret = Some(SecretData::new());
    let without_pod = master("m2", "10.0.0.2", 200);

    let client = MockStaticPodClient::default();
    let mut state = State::default();
    let mut patches = PatchCollector::new();
    let pending = state
        .stop(
            &Inputs {
                masters: vec![with_pod, without_pod],
            },
            &client,
            &mut patches,
        )
        .await;

    assert_eq!(pending, vec!["m1".to_string()]);
    assert_eq!(client.deleted_ips().len(), 2);
    assert_eq!(
        patches.deleted_secret_names(),
        vec!["registry-node-m1-pki", "registry-node-config-m1"]
    );
}
