#![cfg(unix)]

mod common;

use common::sample_wav;
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use voxcast_core::audio::wav;
use voxcast_core::models::f5::{self, F5Config, F5Model};
use voxcast_core::models::openvoice::{self, OpenVoiceConfig, OpenVoiceModel};
use voxcast_core::{
    CloneMode, ErrorKind, Fingerprint, Language, ReferenceSample, Result, SpeechModel,
    VoiceCloningModel, VoiceEmbedding, VoiceProfile,
};

// Stand-in for f5-tts_infer-cli: records its arguments, copies a fixture to
// the requested output and fails like the real CLI on marked text.
const F5_STUB: &str = r#"#!/bin/sh
[ "$1" = "--help" ] && exit 0
printf '%s\n' "$@" > "__DIR__/args.txt"
out=""; text=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output_dir) out="$2"; shift ;;
    --gen_text) text="$2"; shift ;;
  esac
  shift
done
case "$text" in
  *OOM*) echo "RuntimeError: CUDA out of memory. Tried to allocate 2.00 GiB" >&2; exit 1 ;;
  *BAD*) echo "ValueError: text could not be tokenized" >&2; exit 1 ;;
esac
cp "__DIR__/fixture.wav" "$out/out.wav"
"#;

// Stand-in for the OpenVoice helper, run as `<python> stub.sh <subcommand> ...`
const OPENVOICE_STUB: &str = r#"
cmd="$1"; shift
echo "$cmd $* PYTHONPATH=$PYTHONPATH" >> "__DIR__/calls.txt"
out=""; tse=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift ;;
    --target-se) tse="$2"; shift ;;
  esac
  shift
done
case "$cmd" in
  check) exit 0 ;;
  extract) printf 'tone-color' > "$out" ;;
  convert)
    grep -q tone-color "$tse" || { echo "RuntimeError: bad speaker embedding" >&2; exit 3; }
    cp "__DIR__/fixture.wav" "$out" ;;
  *) exit 2 ;;
esac
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let body = body.replace("__DIR__", &dir.to_string_lossy());
    std::fs::write(&path, body).expect("write stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod stub");
    path
}

fn write_fixture(dir: &Path) -> Vec<u8> {
    let bytes = sample_wav(1.0, 220.0);
    std::fs::write(dir.join("fixture.wav"), &bytes).expect("write fixture");
    bytes
}

fn recorded_args(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("args.txt"))
        .expect("stub ran")
        .lines()
        .map(str::to_string)
        .collect()
}

fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let i = args.iter().position(|a| a == flag)?;
    args.get(i + 1).map(String::as_str)
}

fn f5_config(dir: &Path, program: Option<PathBuf>) -> F5Config {
    F5Config {
        program,
        model: "F5TTS_v1_Base".into(),
        ckpt_file: None,
        vocab_file: None,
        nfe_step: 16,
        speed: 1.0,
        cross_fade_duration: 0.15,
        device: "auto".into(),
        model_cache_dir: dir.join("cache"),
        default_voices_dir: dir.join("voices"),
        scratch_dir: dir.join("scratch"),
        probe_timeout_ms: 5_000,
    }
}

fn cloned_profile(conditioning: VoiceEmbedding) -> VoiceProfile {
    let fingerprint = Fingerprint::compute("abc", "Reference words.", CloneMode::Base);
    VoiceProfile {
        id: VoiceProfile::id_for(&fingerprint),
        fingerprint,
        mode: CloneMode::Base,
        transcript: "Reference words.".into(),
        conditioning,
        tone_color: None,
        sample_duration_secs: 1.0,
        source_url: "https://cdn.example.com/ref.wav".into(),
        created_at: chrono::Utc::now(),
    }
}

fn reference_sample(wav_bytes: Vec<u8>) -> Result<ReferenceSample> {
    Ok(ReferenceSample {
        source_url: "https://cdn.example.com/ref.wav".into(),
        content_hash: "abc".into(),
        audio: wav::decode(&wav_bytes)?,
        wav_bytes,
    })
}

#[tokio::test]
#[serial]
async fn f5_generates_with_cloned_voice() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fixture = write_fixture(dir.path());
    let program = write_script(dir.path(), "f5-stub", F5_STUB);
    let model = F5Model::load(f5_config(dir.path(), Some(program))).await?;

    let sample = reference_sample(fixture)?;
    let conditioning = model.embed_reference(&sample, "Reference words.").await?;
    assert_eq!(conditioning.format, f5::EMBEDDING_FORMAT);

    let audio = model
        .generate("Hello there.", Language::En, Some(&cloned_profile(conditioning)))
        .await?;
    assert_eq!(audio.sample_rate, 16_000);
    assert!((audio.duration_secs() - 1.0).abs() < 0.01);

    let args = recorded_args(dir.path());
    assert_eq!(value_after(&args, "--model"), Some("F5TTS_v1_Base"));
    assert_eq!(value_after(&args, "--nfe_step"), Some("16"));
    assert_eq!(value_after(&args, "--ref_text"), Some("Reference words."));
    assert_eq!(value_after(&args, "--gen_text"), Some("Hello there."));
    assert_eq!(value_after(&args, "--output_file"), Some("out.wav"));
    assert!(value_after(&args, "--ref_audio").is_some());
    assert!(!args.iter().any(|a| a == "--device"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn f5_falls_back_to_language_default_voice() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_fixture(dir.path());
    let voices = dir.path().join("voices");
    std::fs::create_dir_all(&voices)?;
    std::fs::write(voices.join("en.wav"), sample_wav(2.0, 180.0))?;
    std::fs::write(voices.join("en.txt"), "Default narrator line.\n")?;
    let program = write_script(dir.path(), "f5-stub", F5_STUB);
    let model = F5Model::load(f5_config(dir.path(), Some(program))).await?;

    model.generate("Hi.", Language::En, None).await?;
    let args = recorded_args(dir.path());
    let expected = voices.join("en.wav");
    assert_eq!(value_after(&args, "--ref_audio"), expected.to_str());
    assert_eq!(value_after(&args, "--ref_text"), Some("Default narrator line."));

    // No default voice for zh: the CLI's bundled voice is used
    model.generate("你好。", Language::Zh, None).await?;
    let args = recorded_args(dir.path());
    assert!(value_after(&args, "--ref_audio").is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn f5_failures_are_classified_by_stderr() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_fixture(dir.path());
    let program = write_script(dir.path(), "f5-stub", F5_STUB);
    let model = F5Model::load(f5_config(dir.path(), Some(program))).await?;

    let oom = model.generate("OOM now.", Language::En, None).await.unwrap_err();
    assert_eq!(oom.kind(), ErrorKind::Inference);
    assert!(oom.is_retryable());
    assert!(oom.to_string().contains("out of memory"));

    let bad = model.generate("BAD input.", Language::En, None).await.unwrap_err();
    assert_eq!(bad.kind(), ErrorKind::Inference);
    assert!(!bad.is_retryable());

    let foreign = cloned_profile(VoiceEmbedding::new("openvoice/tone-color-se", vec![1]));
    let err = model
        .generate("Hello.", Language::En, Some(&foreign))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Inference);
    Ok(())
}

#[tokio::test]
#[serial]
async fn f5_load_fails_without_entry_point() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let missing = F5Model::load(f5_config(dir.path(), None))
        .await
        .err()
        .expect("no program");
    assert_eq!(missing.kind(), ErrorKind::ModelLoad);

    let broken = write_script(dir.path(), "f5-broken", "#!/bin/sh\necho 'No module named f5_tts' >&2\nexit 1\n");
    let err = F5Model::load(f5_config(dir.path(), Some(broken)))
        .await
        .err()
        .expect("probe fails");
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
    assert!(err.to_string().contains("No module named f5_tts"));
    Ok(())
}

fn openvoice_config(dir: &Path, script: Option<PathBuf>) -> OpenVoiceConfig {
    OpenVoiceConfig {
        python: Some(PathBuf::from("/bin/sh")),
        openvoice_dir: dir.join("OpenVoice"),
        script,
        device: "cpu".into(),
        use_vad: true,
        scratch_dir: dir.join("scratch"),
        probe_timeout_ms: 5_000,
    }
}

fn install_converter_weights(cfg: &OpenVoiceConfig) -> Result<()> {
    let ckpt = cfg.checkpoint_dir();
    std::fs::create_dir_all(&ckpt)?;
    std::fs::write(ckpt.join("config.json"), "{}")?;
    std::fs::write(ckpt.join("checkpoint.pth"), "weights")?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn openvoice_extracts_and_converts_through_helper() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fixture = write_fixture(dir.path());
    let stub = write_script(dir.path(), "openvoice-stub.sh", OPENVOICE_STUB);
    let cfg = openvoice_config(dir.path(), Some(stub));
    install_converter_weights(&cfg)?;
    let model = OpenVoiceModel::load(cfg.clone()).await?;

    let tone = model
        .derive_profile(&reference_sample(fixture)?, "Reference words.")
        .await?;
    assert_eq!(tone.format, openvoice::EMBEDDING_FORMAT);
    assert_eq!(tone.data.as_slice(), b"tone-color");

    let source = voxcast_core::AudioBuffer::new(vec![0.1; 8_000], 24_000);
    let converted = model.convert_timbre(&source, &tone).await?;
    assert_eq!(converted.sample_rate, 16_000);

    let calls = std::fs::read_to_string(dir.path().join("calls.txt"))?;
    let lines: Vec<&str> = calls.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("check --checkpoint-dir"));
    assert!(!lines[0].contains("--vad"));
    assert!(lines[1].starts_with("extract ") && lines[1].contains("--vad"));
    assert!(lines[2].starts_with("convert ") && lines[2].contains("--target-se"));
    let python_path = format!("PYTHONPATH={}", cfg.openvoice_dir.display());
    assert!(lines.iter().all(|l| l.contains(&python_path)));
    Ok(())
}

#[tokio::test]
#[serial]
async fn openvoice_rejects_foreign_or_bad_embeddings() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_fixture(dir.path());
    let stub = write_script(dir.path(), "openvoice-stub.sh", OPENVOICE_STUB);
    let cfg = openvoice_config(dir.path(), Some(stub));
    install_converter_weights(&cfg)?;
    let model = OpenVoiceModel::load(cfg).await?;
    let audio = voxcast_core::AudioBuffer::new(vec![0.1; 800], 24_000);

    let foreign = VoiceEmbedding::new(f5::EMBEDDING_FORMAT, vec![0; 4]);
    let err = model.convert_timbre(&audio, &foreign).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Inference);

    let garbled = VoiceEmbedding::new(openvoice::EMBEDDING_FORMAT, b"garbage".to_vec());
    let err = model.convert_timbre(&audio, &garbled).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Inference);
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("bad speaker embedding"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn openvoice_uses_bundled_helper_by_default() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // Interpreter that accepts any script, so only the helper's placement is exercised
    let python = write_script(dir.path(), "fake-python", "#!/bin/sh\nexit 0\n");
    let cfg = OpenVoiceConfig {
        python: Some(python),
        ..openvoice_config(dir.path(), None)
    };
    install_converter_weights(&cfg)?;

    OpenVoiceModel::load(cfg.clone()).await?;

    let helper = std::fs::read_to_string(cfg.scratch_dir.join("voxcast_openvoice.py"))?;
    assert!(helper.contains("ToneColorConverter"));
    assert!(helper.contains("se_extractor.get_se"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn openvoice_load_checks_weights_and_script() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let stub = write_script(dir.path(), "openvoice-stub.sh", OPENVOICE_STUB);

    let cfg = openvoice_config(dir.path(), Some(stub));
    let err = OpenVoiceModel::load(cfg.clone())
        .await
        .err()
        .expect("weights missing");
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
    assert!(err.to_string().contains("checkpoint"));

    install_converter_weights(&cfg)?;
    let err = OpenVoiceModel::load(openvoice_config(
        dir.path(),
        Some(dir.path().join("missing.py")),
    ))
    .await
    .err()
    .expect("script missing");
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
    Ok(())
}
