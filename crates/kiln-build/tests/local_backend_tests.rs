//! End-to-end runs through the host-process backend
#![cfg(unix)]

use kiln_build::{
    BuildError, ImageDefinition, LocalBackend, ParameterDecl, ParameterType, Pipeline,
    PipelineRunner, RunConfig, SetupOperation, SourceRef, StageDefinition, StageStep,
    IMAGE_MANIFEST_FILE,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

fn runtime_base(dir: &Path) -> std::path::PathBuf {
    let base = dir.join("bases/runtime");
    fs::create_dir_all(base.join("usr/bin")).unwrap();
    fs::write(base.join("usr/bin/postgres"), "server").unwrap();
    base
}

fn backend(dir: &Path) -> LocalBackend {
    LocalBackend::new()
        .with_base("runtime", runtime_base(dir))
        .with_empty_base("builder")
        .with_install_command("echo installing")
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=kiln", "-c", "user.email=kiln@localhost"])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?}", args);
}

/// Local repository with `make.sh` tagged as `tag`
fn tagged_repository(dir: &Path, tag: &str) -> String {
    let repo = dir.join("upstream");
    fs::create_dir_all(&repo).unwrap();
    fs::write(
        repo.join("make.sh"),
        "mkdir -p \"$DESTDIR/usr/lib/ext\" && echo \"$KILN_PARAM_VERSION\" > \"$DESTDIR/usr/lib/ext/ext.so\"\n",
    )
    .unwrap();
    git(&repo, &["init", "--quiet"]);
    git(&repo, &["add", "make.sh"]);
    git(&repo, &["commit", "--quiet", "-m", "initial"]);
    git(&repo, &["tag", tag]);
    format!("file://{}", repo.display())
}

#[test]
fn test_index_stage_end_to_end() {
    let dir = TempDir::new().unwrap();
    let stage = StageDefinition::new(
        "audit",
        "builder",
        SourceRef::from_index("https://apt.example.com", "audit-{{pg_major}}"),
        "mkdir -p \"$DESTDIR/usr/lib/pg/$KILN_PARAM_PG_MAJOR\" && \
         echo \"$KILN_INDEX_PACKAGE\" > \"$DESTDIR/usr/lib/pg/$KILN_PARAM_PG_MAJOR/audit.so\" && \
         mkdir -p \"$DESTDIR/usr/bin\" && echo cc > \"$DESTDIR/usr/bin/cc\"",
    )
    .with_setup(SetupOperation::InstallPackages {
        packages: vec!["build-essential".to_string()],
    })
    .with_artifact("/usr/lib/pg/{{pg_major}}/*.so", "/usr/lib/pg/{{pg_major}}/");

    let pipeline = Pipeline::new("audit-image", ImageDefinition::new("runtime", 999))
        .with_parameter(
            ParameterDecl::global("pg_major", ParameterType::Integer).with_default("17"),
        )
        .unwrap()
        .with_stage(stage);

    let output = dir.path().join("out/audit-image");
    let runner = PipelineRunner::new(
        Arc::new(backend(dir.path())),
        RunConfig::new(dir.path().join("work"), &output),
    );
    let report = runner.run(&pipeline, &BTreeMap::new()).unwrap();

    let rootfs = report.image.rootfs();
    assert_eq!(
        fs::read_to_string(rootfs.join("usr/lib/pg/17/audit.so")).unwrap().trim(),
        "audit-17"
    );
    assert!(rootfs.join("usr/bin/postgres").is_file());
    assert!(!rootfs.join("usr/bin/cc").exists());
    assert!(output.join(IMAGE_MANIFEST_FILE).is_file());
    assert_eq!(report.unpinned_stages().collect::<Vec<_>>(), vec!["audit"]);
}

#[test]
fn test_pinned_git_stage_end_to_end() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let repository = tagged_repository(dir.path(), "v1.2.0");

    let stage = StageDefinition::new(
        "ext",
        "builder",
        SourceRef::pinned(repository, "v{{version}}"),
        "sh make.sh",
    )
    .with_artifact("/usr/lib/ext/ext.so", "/usr/lib/postgresql/");

    let pipeline = Pipeline::new("ext-image", ImageDefinition::new("runtime", 26))
        .with_parameter(
            ParameterDecl::stage("ext", "version", ParameterType::String).with_default("1.2.0"),
        )
        .unwrap()
        .with_stage(stage);

    let runner = PipelineRunner::new(
        Arc::new(backend(dir.path())),
        RunConfig::new(dir.path().join("work"), dir.path().join("out")),
    );
    let report = runner.run(&pipeline, &BTreeMap::new()).unwrap();

    assert_eq!(
        fs::read_to_string(report.image.rootfs().join("usr/lib/postgresql/ext.so"))
            .unwrap()
            .trim(),
        "1.2.0"
    );
    assert!(report.stages[0].reproducible);
    assert!(report.stages[0].source.ends_with("@v1.2.0"));
}

#[test]
fn test_missing_tag_fails_fetch() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let repository = tagged_repository(dir.path(), "v1.2.0");

    let stage = StageDefinition::new(
        "ext",
        "builder",
        SourceRef::pinned(repository, "v9.9.9"),
        "sh make.sh",
    )
    .with_artifact("/usr/lib/ext/ext.so", "/usr/lib/postgresql/");
    let pipeline =
        Pipeline::new("ext-image", ImageDefinition::new("runtime", 26)).with_stage(stage);

    let output = dir.path().join("out");
    let runner = PipelineRunner::new(
        Arc::new(backend(dir.path())),
        RunConfig::new(dir.path().join("work"), &output),
    );
    let err = runner.run(&pipeline, &BTreeMap::new()).unwrap_err();

    assert!(matches!(err, BuildError::SourceFetch { .. }), "{:?}", err);
    assert_eq!(err.step(), Some(StageStep::Fetch));
    assert!(!output.exists());
}

fn simple_stage(base: &str) -> StageDefinition {
    StageDefinition::new(
        "ext",
        base,
        SourceRef::from_index("https://apt.example.com", "ext"),
        "mkdir -p \"$DESTDIR/usr/lib\" && echo ext > \"$DESTDIR/usr/lib/ext.so\"",
    )
    .with_artifact("/usr/lib/ext.so", "/usr/lib/")
}

#[test]
fn test_unregistered_stage_base_fails_instantiate() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new("ext-image", ImageDefinition::new("runtime", 26))
        .with_stage(simple_stage("debian:bookworm-slim"));

    let output = dir.path().join("out");
    let runner = PipelineRunner::new(
        Arc::new(backend(dir.path())),
        RunConfig::new(dir.path().join("work"), &output),
    );
    let err = runner.run(&pipeline, &BTreeMap::new()).unwrap_err();

    assert_eq!(err.step(), Some(StageStep::Instantiate));
    assert!(err.to_string().contains("debian:bookworm-slim"), "{}", err);
    assert!(!output.exists());
}

#[test]
fn test_unregistered_image_base_publishes_nothing() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new("ext-image", ImageDefinition::new("postgres:17-bookworm", 999))
        .with_stage(simple_stage("builder"));

    let output = dir.path().join("out");
    let runner = PipelineRunner::new(
        Arc::new(backend(dir.path())),
        RunConfig::new(dir.path().join("work"), &output),
    );
    let err = runner.run(&pipeline, &BTreeMap::new()).unwrap_err();

    assert!(err.to_string().contains("postgres:17-bookworm"), "{}", err);
    assert!(!output.exists());
}

#[test]
fn test_packages_need_an_installer() {
    let dir = TempDir::new().unwrap();
    let stage = simple_stage("builder").with_setup(SetupOperation::InstallPackages {
        packages: vec!["build-essential".to_string()],
    });
    let pipeline =
        Pipeline::new("ext-image", ImageDefinition::new("runtime", 26)).with_stage(stage);

    let backend = LocalBackend::new()
        .with_base("runtime", runtime_base(dir.path()))
        .with_empty_base("builder");
    let runner = PipelineRunner::new(
        Arc::new(backend),
        RunConfig::new(dir.path().join("work"), dir.path().join("out")),
    );
    let err = runner.run(&pipeline, &BTreeMap::new()).unwrap_err();

    assert!(matches!(err, BuildError::Setup { .. }), "{:?}", err);
    assert_eq!(err.step(), Some(StageStep::Setup));
}
