use std::sync::Arc;

use iotv_core::{InMemorySettingsStore, SettingsError, SettingsResolver, TtsSource, TtsVoice};

fn resolver() -> (InMemorySettingsStore, SettingsResolver) {
    let store = InMemorySettingsStore::new();
    let resolver = SettingsResolver::new(Arc::new(store.clone()));
    (store, resolver)
}

#[tokio::test]
async fn falls_back_to_system_default() {
    let (_store, resolver) = resolver();
    let tts = resolver.resolve("dev1", None).await.unwrap();
    assert_eq!(tts.source, TtsSource::Default);
    assert_eq!(
        (tts.provider.as_str(), tts.model.as_str(), tts.voice.as_str()),
        ("doubao", "speech-1", "doubao-standard")
    );

    let tts = resolver.resolve("", Some("")).await.unwrap();
    assert_eq!(tts.source, TtsSource::Default);
}

#[tokio::test]
async fn app_setting_applies_without_device_override() {
    let (store, resolver) = resolver();
    store.put_app("123", TtsVoice::new("p1", "m1", "v1"));

    let tts = resolver.resolve("dev1", Some("123")).await.unwrap();
    assert_eq!(tts.source, TtsSource::App);
    assert_eq!(tts.provider, "p1");
    assert_eq!(tts.model, "m1");
    assert_eq!(tts.voice, "v1");

    let other_app = resolver.resolve("dev1", Some("999")).await.unwrap();
    assert_eq!(other_app.source, TtsSource::Default);
}

#[tokio::test]
async fn device_override_beats_app_setting() {
    let (store, resolver) = resolver();
    store.put_app("123", TtsVoice::new("p1", "m1", "v1"));
    store.put_device("dev1", TtsVoice::new("p2", "m2", "v2"));

    let tts = resolver.resolve("dev1", Some("123")).await.unwrap();
    assert_eq!(tts.source, TtsSource::Device);
    assert_eq!(tts.provider, "p2");
    assert_eq!(tts.voice, "v2");
}

#[tokio::test]
async fn soft_deleted_override_is_ignored() {
    let (store, resolver) = resolver();
    store.put_app("123", TtsVoice::new("p1", "m1", "v1"));
    store.put_device("dev1", TtsVoice::new("p2", "m2", "v2"));
    store.delete_device("dev1");

    let tts = resolver.resolve("dev1", Some("123")).await.unwrap();
    assert_eq!(tts.source, TtsSource::App);
}

#[tokio::test]
async fn store_outage_is_not_masked_as_default() {
    let (store, resolver) = resolver();
    store.set_offline(true);

    let err = resolver.resolve("dev1", Some("123")).await.unwrap_err();
    assert!(matches!(err, SettingsError::Unavailable(_)));
}

#[tokio::test]
async fn device_tier_skipped_for_blank_device() {
    let (store, resolver) = resolver();
    store.put_device("", TtsVoice::new("p9", "m9", "v9"));
    store.put_app("7", TtsVoice::new("p1", "m1", "v1"));

    let tts = resolver.resolve("  ", Some("7")).await.unwrap();
    assert_eq!(tts.source, TtsSource::App);
}
