use std::path::{Path, PathBuf};

use cycpep_jobs::SubmitRequest;

const STRUCTURE_SCRIPT: &str = "predict_structure.py";
const MULTIMER_SCRIPT: &str = "predict_multimer.py";
const AFFINITY_SCRIPT: &str = "predict_affinity.py";
const MODIFIED_SCRIPT: &str = "predict_modified.py";

/// Where the prediction scripts live and which interpreter runs them.
///
/// Jobs run inside their own work directory, so every relative path handed
/// to a script is resolved against `base_dir` up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionScripts {
    pub python: String,
    pub scripts_dir: PathBuf,
    pub base_dir: PathBuf,
}

impl PredictionScripts {
    /// Resolves relative paths against the current directory.
    pub fn new(python: impl Into<String>, scripts_dir: impl Into<PathBuf>) -> Self {
        let base_dir = match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(error) => {
                tracing::warn!(%error, "current directory unavailable; script paths stay relative");
                PathBuf::new()
            }
        };
        Self::with_base_dir(python, scripts_dir, base_dir)
    }

    pub fn with_base_dir(
        python: impl Into<String>,
        scripts_dir: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        let base_dir = base_dir.into();
        let python = python.into();
        // Bare names are looked up on PATH; only path-like interpreters are anchored.
        let python = if Path::new(&python).components().count() > 1 {
            display_path(&base_dir.join(&python))
        } else {
            python
        };
        Self {
            python,
            scripts_dir: base_dir.join(scripts_dir.into()),
            base_dir,
        }
    }

    pub fn script_path(&self, script: &str) -> PathBuf {
        self.scripts_dir.join(script)
    }

    /// `predict_structure.py --input SEQ [--output DIR]`.
    pub fn structure(
        &self,
        sequence: &str,
        output_dir: Option<&str>,
        job_name: Option<String>,
    ) -> SubmitRequest {
        let mut args = vec!["--input".to_string(), sequence.to_string()];
        self.push_output_dir(&mut args, output_dir);
        self.request(
            STRUCTURE_SCRIPT,
            args,
            job_name.unwrap_or_else(|| format!("structure_{}", prefix(sequence, 10))),
        )
    }

    /// `predict_multimer.py --sequences S1 S2 .. [--chain-ids A B ..] [--output DIR]`.
    pub fn multimer(
        &self,
        sequences: &[String],
        chain_ids: &[String],
        output_dir: Option<&str>,
        job_name: Option<String>,
    ) -> SubmitRequest {
        let mut args = vec!["--sequences".to_string()];
        args.extend(sequences.iter().cloned());
        if !chain_ids.is_empty() {
            args.push("--chain-ids".to_string());
            args.extend(chain_ids.iter().cloned());
        }
        self.push_output_dir(&mut args, output_dir);
        self.request(
            MULTIMER_SCRIPT,
            args,
            job_name.unwrap_or_else(|| format!("multimer_{}_peptides", sequences.len())),
        )
    }

    /// `predict_affinity.py --peptide P --target T [--output DIR]`.
    pub fn affinity(
        &self,
        peptide_sequence: &str,
        target_sequence: &str,
        output_dir: Option<&str>,
        job_name: Option<String>,
    ) -> SubmitRequest {
        let mut args = vec![
            "--peptide".to_string(),
            peptide_sequence.to_string(),
            "--target".to_string(),
            target_sequence.to_string(),
        ];
        self.push_output_dir(&mut args, output_dir);
        self.request(
            AFFINITY_SCRIPT,
            args,
            job_name.unwrap_or_else(|| format!("affinity_{}", prefix(peptide_sequence, 8))),
        )
    }

    /// `predict_modified.py --sequence S [--modifications M] [--output DIR]`.
    pub fn modified_peptide(
        &self,
        sequence: &str,
        modifications: Option<&str>,
        output_dir: Option<&str>,
        job_name: Option<String>,
    ) -> SubmitRequest {
        let mut args = vec!["--sequence".to_string(), sequence.to_string()];
        if let Some(modifications) = modifications {
            args.push("--modifications".to_string());
            args.push(modifications.to_string());
        }
        self.push_output_dir(&mut args, output_dir);
        self.request(
            MODIFIED_SCRIPT,
            args,
            job_name.unwrap_or_else(|| format!("modified_{}", prefix(sequence, 10))),
        )
    }

    /// Arguments of the quick `predict_modified.py --list-modifications` query.
    pub fn list_modifications_args(&self) -> Vec<String> {
        vec![
            display_path(&self.script_path(MODIFIED_SCRIPT)),
            "--list-modifications".to_string(),
        ]
    }

    fn request(&self, script: &str, args: Vec<String>, job_name: String) -> SubmitRequest {
        let mut argv = vec![display_path(&self.script_path(script))];
        argv.extend(args);
        SubmitRequest::new(self.python.clone(), argv).with_job_name(job_name)
    }

    fn push_output_dir(&self, args: &mut Vec<String>, output_dir: Option<&str>) {
        if let Some(output_dir) = output_dir {
            args.push("--output".to_string());
            args.push(display_path(&self.base_dir.join(output_dir)));
        }
    }
}

fn prefix(value: &str, chars: usize) -> String {
    value.chars().take(chars).collect()
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
