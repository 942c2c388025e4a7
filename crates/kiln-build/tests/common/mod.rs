//! Scripted stage backend shared by the integration tests

#![allow(dead_code)]

use kiln_build::{CommandOutput, SetupOperation, StageBackend, StageContext, StageStep};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// One backend invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Instantiate { base: String },
    Setup { stage: String, operation: String },
    Fetch { stage: String, repository: String, revision: String },
    Build { stage: String, command: String, env: BTreeMap<String, String> },
}

#[derive(Default)]
struct Gate {
    arrived: usize,
    failed: bool,
}

/// Backend that writes canned files instead of running anything
#[derive(Default)]
pub struct ScriptedBackend {
    bases: BTreeMap<String, Vec<(String, String)>>,
    outputs: BTreeMap<String, Vec<(String, String)>>,
    failures: BTreeMap<String, StageStep>,
    hold_until_failure: Vec<String>,
    rendezvous: Option<usize>,
    calls: Mutex<Vec<Call>>,
    gate: Mutex<Gate>,
    signal: Condvar,
    all_met: Mutex<Option<bool>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files present in base environment `base`
    pub fn with_base_file(mut self, base: &str, path: &str, contents: &str) -> Self {
        self.bases
            .entry(base.to_string())
            .or_default()
            .push((path.to_string(), contents.to_string()));
        self
    }

    /// File the build command of `stage` writes into the stage root
    pub fn produces(mut self, stage: &str, path: &str, contents: &str) -> Self {
        self.outputs
            .entry(stage.to_string())
            .or_default()
            .push((path.to_string(), contents.to_string()));
        self
    }

    /// Make `stage` fail at `step`
    pub fn failing_at(mut self, stage: &str, step: StageStep) -> Self {
        self.failures.insert(stage.to_string(), step);
        self
    }

    /// Block `stage` in its setup until another stage has failed
    pub fn holding_until_failure(mut self, stage: &str) -> Self {
        self.hold_until_failure.push(stage.to_string());
        self
    }

    /// Builds wait until `count` stages are building at the same time
    pub fn with_rendezvous(mut self, count: usize) -> Self {
        self.rendezvous = Some(count);
        self
    }

    /// Whether every build saw all rendezvous participants arrive
    pub fn rendezvous_met(&self) -> Option<bool> {
        *self.all_met.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| match c {
                Call::Setup { stage: s, .. }
                | Call::Fetch { stage: s, .. }
                | Call::Build { stage: s, .. } => s == stage,
                Call::Instantiate { .. } => false,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn fails(&self, stage: &str, step: StageStep) -> bool {
        if self.failures.get(stage) == Some(&step) {
            let mut gate = self.gate.lock().unwrap();
            gate.failed = true;
            self.signal.notify_all();
            true
        } else {
            false
        }
    }

    fn wait_for_failure(&self) {
        let gate = self.gate.lock().unwrap();
        let (_gate, _) = self
            .signal
            .wait_timeout_while(gate, Duration::from_secs(10), |g| !g.failed)
            .unwrap();
        // Give the runner time to raise the cancellation flag.
        thread::sleep(Duration::from_millis(200));
    }

    fn meet(&self, count: usize) {
        let mut gate = self.gate.lock().unwrap();
        gate.arrived += 1;
        self.signal.notify_all();
        let (gate, _) = self
            .signal
            .wait_timeout_while(gate, Duration::from_secs(10), |g| g.arrived < count)
            .unwrap();
        let met = gate.arrived >= count;
        drop(gate);

        let mut all_met = self.all_met.lock().unwrap();
        *all_met = Some(all_met.unwrap_or(true) && met);
    }
}

fn write_files(root: &Path, files: &[(String, String)]) -> io::Result<()> {
    for (path, contents) in files {
        let target = root.join(path.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, contents)?;
    }
    Ok(())
}

impl StageBackend for ScriptedBackend {
    fn instantiate(&self, base: &str, root: &Path) -> io::Result<()> {
        self.record(Call::Instantiate {
            base: base.to_string(),
        });
        fs::create_dir_all(root)?;
        match self.bases.get(base) {
            Some(files) => write_files(root, files),
            None if base.starts_with("missing") => {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such base"))
            }
            None => Ok(()),
        }
    }

    fn apply_setup(&self, ctx: &StageContext, op: &SetupOperation) -> io::Result<CommandOutput> {
        self.record(Call::Setup {
            stage: ctx.stage.clone(),
            operation: op.describe(),
        });
        if self.hold_until_failure.contains(&ctx.stage) {
            self.wait_for_failure();
        }
        if self.fails(&ctx.stage, StageStep::Setup) {
            return Ok(CommandOutput::failed(100, "E: Unable to locate package"));
        }
        Ok(CommandOutput::ok())
    }

    fn fetch_source(
        &self,
        ctx: &StageContext,
        repository: &str,
        revision: &str,
    ) -> io::Result<CommandOutput> {
        self.record(Call::Fetch {
            stage: ctx.stage.clone(),
            repository: repository.to_string(),
            revision: revision.to_string(),
        });
        if self.fails(&ctx.stage, StageStep::Fetch) {
            return Ok(CommandOutput::failed(
                128,
                format!("fatal: Remote branch {} not found in upstream origin", revision),
            ));
        }
        fs::create_dir_all(&ctx.source_dir)?;
        fs::write(ctx.source_dir.join("Makefile"), "all:\n")?;
        Ok(CommandOutput::ok())
    }

    fn run_build(&self, ctx: &StageContext, command: &str) -> io::Result<CommandOutput> {
        self.record(Call::Build {
            stage: ctx.stage.clone(),
            command: command.to_string(),
            env: ctx.environment(),
        });
        if let Some(count) = self.rendezvous {
            self.meet(count);
        }
        if self.fails(&ctx.stage, StageStep::Build) {
            return Ok(CommandOutput::failed(2, "make: *** [all] Error 1"));
        }
        if let Some(files) = self.outputs.get(&ctx.stage) {
            write_files(&ctx.root, files)?;
        }
        Ok(CommandOutput::ok())
    }
}
