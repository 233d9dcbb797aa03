//! HTTP API

mod audio;
mod auth;
mod health;
mod models;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    // Base64 audio easily exceeds axum's 2 MB extractor default
    let body_limit = state.gateway.config().server.max_body_bytes;

    let v1_routes = Router::new()
        .route("/models", get(models::list_models))
        .route("/models/:id", get(models::get_model))
        .route("/models/:id/load", post(models::load_model))
        .route("/models/:id/unload", post(models::unload_model))
        .route(
            "/audio/transcriptions",
            post(audio::transcriptions).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route(
            "/audio/speech",
            post(audio::speech).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route(
            "/audio/vad",
            post(audio::vad).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let cors_enabled = state.gateway.config().server.cors_enabled;

    let router = Router::new()
        .route("/health", get(health::health))
        .nest("/v1", v1_routes)
        .layer(TraceLayer::new_for_http());

    let router = if cors_enabled {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use base64::Engine as _;
    use serde_json::{json, Value};
    use speechgate_core::config::{DefaultModels, ModelEntry};
    use speechgate_core::{
        BackendModel, CapabilityKind, Gateway, GatewayConfig, InferenceOutput, InferencePayload,
        ModelBackend, ModelDescriptor, Result, SpeechSegment,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[derive(Default)]
    struct EchoBackend {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ModelBackend for EchoBackend {
        async fn load(&self, descriptor: &ModelDescriptor) -> Result<BackendModel> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(BackendModel::new(descriptor.id.clone()))
        }

        async fn unload(&self, _descriptor: &ModelDescriptor, _model: BackendModel) -> Result<()> {
            Ok(())
        }

        async fn infer(
            &self,
            _descriptor: &ModelDescriptor,
            _model: &BackendModel,
            kind: CapabilityKind,
            language: &str,
            payload: &InferencePayload,
        ) -> Result<InferenceOutput> {
            Ok(match (kind, payload) {
                (CapabilityKind::Stt, InferencePayload::Audio { data, .. }) => {
                    InferenceOutput::Transcription {
                        text: format!("{} bytes", data.len()),
                        language: Some(language.to_string()),
                    }
                }
                (_, InferencePayload::Audio { .. }) => InferenceOutput::VoiceActivity {
                    segments: vec![SpeechSegment {
                        start_ms: 0,
                        end_ms: 250,
                    }],
                },
                (_, InferencePayload::Text { text, .. }) => InferenceOutput::Speech {
                    audio: text.clone().into_bytes().into(),
                    sample_rate: 22050,
                    format: "wav".to_string(),
                },
            })
        }
    }

    fn app(api_key: Option<&str>) -> (Router, Arc<EchoBackend>) {
        app_with(|config| config.server.api_key = api_key.map(str::to_string))
    }

    fn app_with(configure: impl FnOnce(&mut GatewayConfig)) -> (Router, Arc<EchoBackend>) {
        let mut config = GatewayConfig {
            models: vec![
                ModelEntry::new("whisper", CapabilityKind::Stt),
                ModelEntry::new("piper", CapabilityKind::Tts),
                ModelEntry::new("silero", CapabilityKind::Vad),
            ],
            defaults: DefaultModels {
                stt: Some("whisper".to_string()),
                tts: Some("piper".to_string()),
                vad: None,
            },
            ..GatewayConfig::default()
        };
        configure(&mut config);

        let backend = Arc::new(EchoBackend::default());
        let gateway = Arc::new(Gateway::new(config, backend.clone()).unwrap());
        (create_router(AppState::new(gateway)), backend)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn audio_b64(len: usize) -> String {
        base64::engine::general_purpose::STANDARD.encode(vec![0u8; len])
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let (app, _) = app(Some("secret"));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["allowed_languages"], json!(["en", "tr"]));
    }

    #[tokio::test]
    async fn test_bearer_token_required() {
        let (app, _) = app(Some("secret"));

        let response = app
            .clone()
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::get("/v1/models")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::get("/v1/models")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["models"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transcription() {
        let (app, backend) = app(None);
        let response = app
            .oneshot(post_json(
                "/v1/audio/transcriptions",
                json!({ "audio_base64": audio_b64(16), "language": "tr" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["model"], "whisper");
        assert_eq!(body["text"], "16 bytes");
        assert_eq!(body["language"], "tr");
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_language_is_rejected_without_loading() {
        let (app, backend) = app(None);
        let response = app
            .oneshot(post_json(
                "/v1/audio/transcriptions",
                json!({ "audio_base64": audio_b64(16), "language": "fr" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_speech_and_vad() {
        let (app, _) = app(None);

        let response = app
            .clone()
            .oneshot(post_json("/v1/audio/speech", json!({ "input": "merhaba" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["sample_rate"], 22050);
        let audio = base64::engine::general_purpose::STANDARD
            .decode(body["audio_base64"].as_str().unwrap())
            .unwrap();
        assert_eq!(audio, b"merhaba");

        // No VAD default configured
        let response = app
            .clone()
            .oneshot(post_json("/v1/audio/vad", json!({ "audio_base64": audio_b64(2) })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(post_json(
                "/v1/audio/vad",
                json!({ "audio_base64": audio_b64(2), "model": "silero" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["segments"][0]["end_ms"], 250);
    }

    #[tokio::test]
    async fn test_bad_base64_and_unknown_model() {
        let (app, _) = app(None);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/audio/transcriptions",
                json!({ "audio_base64": "not base64!" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(Request::get("/v1/models/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_load_and_unload_endpoints() {
        let (app, backend) = app(None);

        let response = app
            .clone()
            .oneshot(Request::post("/v1/models/whisper/load").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "ready");
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);

        let response = app
            .clone()
            .oneshot(Request::get("/v1/models/whisper").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["is_default"], true);
        assert_eq!(body["instance"]["ref_count"], 0);

        let response = app
            .clone()
            .oneshot(Request::post("/v1/models/whisper/unload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::post("/v1/models/whisper/unload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_large_audio_upload_reaches_dispatcher() {
        let (app, _) = app(None);
        let size = 3 * 1024 * 1024;
        let response = app
            .oneshot(post_json(
                "/v1/audio/transcriptions",
                json!({ "audio_base64": audio_b64(size) }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["text"], format!("{size} bytes"));
    }

    #[tokio::test]
    async fn test_body_limit_is_configurable() {
        let (app, backend) = app_with(|config| config.server.max_body_bytes = 1024);
        let response = app
            .oneshot(post_json(
                "/v1/audio/transcriptions",
                json!({ "audio_base64": audio_b64(4096) }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
    }
}
