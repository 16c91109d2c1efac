use serde_json::json;
use voxcast_core::voice::{NewVoice, VoiceUpdate};
use voxcast_core::{ErrorKind, Language, Result, VoiceRegistry};

fn narrator(user: &str) -> NewVoice {
    NewVoice {
        user_id: user.to_string(),
        name: "Narrator".to_string(),
        voice_sample_url: "https://cdn.example.com/narrator.wav".to_string(),
        transcript: "  Once upon a time.  ".to_string(),
        language: Language::En,
        metadata: json!({ "style": "calm" }).as_object().cloned().unwrap_or_default(),
    }
}

#[tokio::test]
async fn voices_survive_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let created = {
        let registry = VoiceRegistry::open(dir.path()).await?;
        assert!(registry.is_empty().await);
        let voice = registry.create(narrator("user-1")).await?;
        registry.create(narrator("user-2")).await?;
        voice
    };
    assert!(created.id.starts_with("voice_"));
    assert_eq!(created.transcript, "Once upon a time.");

    let registry = VoiceRegistry::open(dir.path()).await?;
    assert_eq!(registry.len().await, 2);
    assert_eq!(registry.get(&created.id).await, Some(created.clone()));
    assert!(registry.path().ends_with("profiles.json"));
    Ok(())
}

#[tokio::test]
async fn list_is_scoped_to_user_and_ordered() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = VoiceRegistry::open(dir.path()).await?;

    let first = registry.create(narrator("user-1")).await?;
    let second = registry.create(narrator("user-1")).await?;
    registry.create(narrator("user-2")).await?;

    let ids: Vec<String> = registry
        .list_for_user("user-1")
        .await
        .into_iter()
        .map(|v| v.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first.id) && ids.contains(&second.id));
    assert!(registry.list_for_user("nobody").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn update_merges_metadata_and_keeps_other_fields() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = VoiceRegistry::open(dir.path()).await?;
    let voice = registry.create(narrator("user-1")).await?;

    let updated = registry
        .update(
            &voice.id,
            VoiceUpdate {
                name: Some("Storyteller".into()),
                metadata: json!({ "pace": "slow" }).as_object().cloned(),
                ..VoiceUpdate::default()
            },
        )
        .await?
        .expect("voice exists");

    assert_eq!(updated.name, "Storyteller");
    assert_eq!(updated.voice_sample_url, voice.voice_sample_url);
    assert_eq!(updated.metadata["style"], "calm");
    assert_eq!(updated.metadata["pace"], "slow");
    assert!(updated.updated_at >= voice.updated_at);
    assert_eq!(updated.created_at, voice.created_at);

    assert!(registry
        .update("voice_missing", VoiceUpdate::default())
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn invalid_voices_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = VoiceRegistry::open(dir.path()).await?;

    let mut bad_url = narrator("user-1");
    bad_url.voice_sample_url = "file:///etc/passwd".into();
    let mut no_name = narrator("user-1");
    no_name.name = " ".into();

    for voice in [bad_url, no_name] {
        let err = registry.create(voice).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert!(registry.is_empty().await);

    let voice = registry.create(narrator("user-1")).await?;
    let err = registry
        .update(
            &voice.id,
            VoiceUpdate {
                voice_sample_url: Some("not a url".into()),
                ..VoiceUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    Ok(())
}

#[tokio::test]
async fn delete_reports_whether_voice_existed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = VoiceRegistry::open(dir.path()).await?;
    let voice = registry.create(narrator("user-1")).await?;

    assert!(registry.delete(&voice.id).await?);
    assert!(!registry.delete(&voice.id).await?);

    let reopened = VoiceRegistry::open(dir.path()).await?;
    assert!(reopened.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn corrupt_registry_file_fails_to_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("profiles.json"), "{ not json")?;

    let err = VoiceRegistry::open(dir.path()).await.err().expect("corrupt file");
    assert_eq!(err.kind(), ErrorKind::Internal);
    Ok(())
}
