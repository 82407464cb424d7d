//! Admin API routes driven through the router without a socket.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use gemsieve::config::Config;
use gemsieve::models::{
    GemExplanation, GemSignal, GemType, NewGem, RelationshipType, SenderProfile,
};
use gemsieve::pipeline::Services;
use gemsieve::server::{app_state_for, build_router};
use gemsieve::store::Store;

fn seeded_services(dir: &tempfile::TempDir) -> Arc<Services> {
    let mut config = Config::default();
    config.storage.sqlite_path = dir.path().join("admin.db");

    let store = Store::open(&config.storage.sqlite_path).expect("store");
    store
        .upsert_profile(&SenderProfile {
            sender_domain: "acme.com".to_string(),
            company_name: "Acme".to_string(),
            industry: "SaaS".to_string(),
            ..SenderProfile::default()
        })
        .expect("profile");
    store
        .set_relationship("acme.com", RelationshipType::WarmContact, None, false, "manual")
        .expect("relationship");
    store
        .insert_gem(&NewGem {
            gem_type: GemType::PartnerProgram,
            sender_domain: "acme.com".to_string(),
            thread_id: None,
            score: 45,
            explanation: GemExplanation {
                gem_type: GemType::PartnerProgram,
                summary: "Partner program detected".to_string(),
                signals: vec![GemSignal::evidence("partner_program_detected", "links")],
                confidence: 0.8,
                estimated_value: "medium".to_string(),
                urgency: "low".to_string(),
            },
            recommended_actions: Vec::new(),
            source_message_ids: Vec::new(),
        })
        .expect("gem");

    Arc::new(Services::from_config(config))
}

async fn get_json(router: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn stats_and_browse_endpoints_serve_seeded_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let services = seeded_services(&dir);
    let router = build_router(app_state_for(services));

    let (status, stats) = get_json(router.clone(), "/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["sender_profiles"], 1);
    assert_eq!(stats["gems"], 1);

    let (status, gems) = get_json(router.clone(), "/api/gems").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gems.as_array().expect("array").len(), 1);
    assert_eq!(gems[0]["gem_type"], "partner_program");

    let (status, profile) = get_json(router.clone(), "/api/profiles/acme.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["profile"]["company_name"], "Acme");
    assert_eq!(profile["relationship"]["relationship_type"], "warm_contact");

    let (status, by_type) = get_json(router.clone(), "/api/stats/gems-by-type").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_type["partner_program"], 1);

    let (status, stages) = get_json(router, "/api/stages").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stages.as_array().expect("array").len(), 7);
}

#[tokio::test]
async fn unknown_resources_return_404_and_bad_stages_400() {
    let dir = tempfile::tempdir().expect("tempdir");
    let services = seeded_services(&dir);
    let router = build_router(app_state_for(services));

    let (status, _) = get_json(router.clone(), "/api/gems/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get_json(router.clone(), "/api/profiles/nobody.example").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/pipeline/run/shine")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pipeline_run_endpoint_submits_and_reports_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let services = seeded_services(&dir);
    let router = build_router(app_state_for(services.clone()));

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/pipeline/run/metadata")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(value["status"], "submitted");
    let run_id = value["run_id"].as_i64().expect("run id");

    // The run row exists immediately, whatever state the worker is in.
    let (status, run) = get_json(
        router.clone(),
        &format!("/api/pipeline/status/{run_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["stage"], "metadata");
    assert_eq!(run["triggered_by"], "web");

    let (status, runs) = get_json(router, "/api/pipeline/runs").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!runs.as_array().expect("array").is_empty());
}

#[tokio::test]
async fn gem_generate_endpoint_enqueues_engagement() {
    let dir = tempfile::tempdir().expect("tempdir");
    let services = seeded_services(&dir);
    let router = build_router(app_state_for(services.clone()));

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/gems/1/generate")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/gems/999/generate")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ai_audit_listing_pages_and_resolves_details() {
    let dir = tempfile::tempdir().expect("tempdir");
    let services = seeded_services(&dir);
    {
        let store = Store::open(&services.config.storage.sqlite_path).expect("store");
        let run_id = store.create_run("classify", "web", None).expect("run");
        for i in 0..3 {
            store
                .insert_audit_entry(&gemsieve::store::NewAuditEntry {
                    pipeline_run_id: run_id,
                    stage: "classify".to_string(),
                    sender_domain: "acme.com".to_string(),
                    prompt_template: "CLASSIFICATION_PROMPT".to_string(),
                    prompt_rendered: format!("prompt {i}"),
                    system_prompt: "json".to_string(),
                    model_used: "ollama:mistral-nemo".to_string(),
                    response_raw: "{}".to_string(),
                    response_parsed: Some("{}".to_string()),
                    duration_ms: 10,
                })
                .expect("entry");
        }
    }
    let router = build_router(app_state_for(services));

    let (status, entries) = get_json(router.clone(), "/api/ai-audit?stage=classify&limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entries.as_array().expect("array").len(), 2);

    let (status, entry) = get_json(router, "/api/ai-audit/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["prompt_template"], "CLASSIFICATION_PROMPT");
}
