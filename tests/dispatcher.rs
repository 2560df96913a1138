use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ditto_imagegen::utils::test_support::{
    TINY_PNG, refused_base_url, should_skip_httpmock, tiny_png_data_uri,
};
use ditto_imagegen::{
    ChatCompletionsImages, CredentialSet, Dispatcher, FailureCategory, GenerationFailure, ImageStore,
    ImagesApi, ProviderKind, Result, RetryExecutor, Sleeper,
};
use httpmock::{
    Method::{GET, POST},
    MockServer,
};

#[derive(Default)]
struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

fn keys(names: &[&str]) -> Result<CredentialSet> {
    CredentialSet::new(names.iter().map(|name| name.to_string()).collect())
}

#[tokio::test]
async fn quota_on_first_key_rotates_to_second_without_backoff() -> Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let limited = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer k1");
            then.status(429)
                .header("content-type", "application/json")
                .body(r#"{"error":{"message":"rate limited"}}"#);
        })
        .await;
    let ok = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer k2");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    serde_json::json!({
                        "choices": [{
                            "message": {
                                "role": "assistant",
                                "content": format!("here you go {}", tiny_png_data_uri())
                            }
                        }]
                    })
                    .to_string(),
                );
        })
        .await;

    let dir = tempfile::tempdir()?;
    let store = Arc::new(ImageStore::new(dir.path()));
    let sleeper = Arc::new(RecordingSleeper::default());
    let adapter = ChatCompletionsImages::new(store.clone()).with_base_url(server.base_url());
    let dispatcher = Dispatcher::new(store.clone()).with_provider(
        Arc::new(adapter),
        keys(&["k1", "k2"])?,
        RetryExecutor::new(3).with_sleeper(sleeper.clone()),
    );

    let image = dispatcher
        .generate("a red bicycle", Vec::new(), ProviderKind::ChatCompletions)
        .await
        .expect("second key should succeed");

    limited.assert_calls_async(1).await;
    ok.assert_calls_async(1).await;
    assert!(sleeper.slept.lock().unwrap().is_empty());
    assert_eq!(tokio::fs::read(&image.path).await?, TINY_PNG);
    assert!(image.url.starts_with("file://"));
    assert_eq!(store.last_saved().await, Some(image));

    let rotator = dispatcher
        .rotator(ProviderKind::ChatCompletions)
        .expect("registered");
    assert_eq!(rotator.position().await, 1);
    Ok(())
}

#[tokio::test]
async fn server_errors_back_off_then_exhaust_single_key() -> Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(500).body("internal error");
        })
        .await;

    let dir = tempfile::tempdir()?;
    let store = Arc::new(ImageStore::new(dir.path()));
    let sleeper = Arc::new(RecordingSleeper::default());
    let adapter = ChatCompletionsImages::new(store.clone()).with_base_url(server.base_url());
    let dispatcher = Dispatcher::new(store).with_provider(
        Arc::new(adapter),
        keys(&["k1"])?,
        RetryExecutor::new(3).with_sleeper(sleeper.clone()),
    );

    let failure = dispatcher
        .generate("a red bicycle", Vec::new(), ProviderKind::ChatCompletions)
        .await
        .unwrap_err();

    failing.assert_calls_async(3).await;
    assert!(
        matches!(
            &failure,
            GenerationFailure::AllCredentialsExhausted { last: Some(last) }
                if matches!(last.as_ref(), GenerationFailure::TransientProvider(_))
        ),
        "{failure:?}"
    );
    assert_eq!(
        *sleeper.slept.lock().unwrap(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
    Ok(())
}

#[tokio::test]
async fn images_api_quota_exhausts_key_without_sleeping() -> Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let limited = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/v3/images/generations");
            then.status(429).body(r#"{"error":{"message":"too many requests"}}"#);
        })
        .await;

    let dir = tempfile::tempdir()?;
    let store = Arc::new(ImageStore::new(dir.path()));
    let sleeper = Arc::new(RecordingSleeper::default());
    let adapter = ImagesApi::new(store.clone()).with_base_url(server.base_url());
    let dispatcher = Dispatcher::new(store).with_provider(
        Arc::new(adapter),
        keys(&["ark-1"])?,
        RetryExecutor::new(3).with_sleeper(sleeper.clone()),
    );

    let failure = dispatcher
        .generate("a red bicycle", Vec::new(), ProviderKind::ImagesApi)
        .await
        .unwrap_err();

    limited.assert_calls_async(1).await;
    assert!(sleeper.slept.lock().unwrap().is_empty());
    assert_eq!(
        failure,
        GenerationFailure::AllCredentialsExhausted {
            last: Some(Box::new(GenerationFailure::QuotaExceeded(
                "too many requests".to_string()
            ))),
        }
    );
    Ok(())
}

#[tokio::test]
async fn images_api_downloads_from_raw_body_url() -> Result<()> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let image_url = server.url("/generated/abc.jpeg");
    let generate = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/v3/images/generations")
                .body_includes("\"watermark\":true");
            then.status(200)
                .body(format!("data: {{\"url\":\"{image_url}\"}}\n\ndata: [DONE]\n"));
        })
        .await;
    let download = server
        .mock_async(|when, then| {
            when.method(GET).path("/generated/abc.jpeg");
            then.status(200)
                .header("content-type", "image/jpeg")
                .body(TINY_PNG);
        })
        .await;

    let dir = tempfile::tempdir()?;
    let store = Arc::new(ImageStore::new(dir.path()));
    let adapter = ImagesApi::new(store.clone()).with_base_url(server.base_url());
    let dispatcher = Dispatcher::new(store).with_provider(
        Arc::new(adapter),
        keys(&["ark-1"])?,
        RetryExecutor::default(),
    );

    let image = dispatcher
        .generate("a red bicycle", Vec::new(), ProviderKind::ImagesApi)
        .await
        .expect("image url in raw body");

    generate.assert_async().await;
    download.assert_async().await;
    assert_eq!(image.url, image_url);
    assert_eq!(
        image.path.extension().and_then(|ext| ext.to_str()),
        Some("jpg")
    );
    Ok(())
}

#[tokio::test]
async fn unreachable_provider_is_retried_then_reported_as_network_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(ImageStore::new(dir.path()));
    let sleeper = Arc::new(RecordingSleeper::default());
    let adapter = ChatCompletionsImages::new(store.clone()).with_base_url(refused_base_url());
    let dispatcher = Dispatcher::new(store).with_provider(
        Arc::new(adapter),
        keys(&["k1"])?,
        RetryExecutor::new(3).with_sleeper(sleeper.clone()),
    );

    let failure = dispatcher
        .generate("a red bicycle", Vec::new(), ProviderKind::ChatCompletions)
        .await
        .unwrap_err();

    assert!(
        matches!(
            &failure,
            GenerationFailure::AllCredentialsExhausted { last: Some(last) }
                if matches!(last.as_ref(), GenerationFailure::Network(_))
        ),
        "{failure:?}"
    );
    assert_eq!(failure.category(), FailureCategory::Network);
    assert_eq!(
        *sleeper.slept.lock().unwrap(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
    Ok(())
}
