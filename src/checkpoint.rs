use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::TrainError,
    model::TrainableModel,
    optimizer::{LossScalerState, Optimizer, OptimizerState},
    scheduler::{LrScheduler, SchedulerState},
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";

const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer-state.json";
const SCHEDULER_FILENAME: &str = "scheduler-state.json";
const SCALER_FILENAME: &str = "scaler-state.json";
const TRAINER_FILENAME: &str = "trainer-state.json";
const MANIFEST_FILENAME: &str = "manifest.json";

/// What the caller asks for at startup: a fresh run, the newest checkpoint
/// under the output directory, or one specific checkpoint.
#[derive(Debug, Clone)]
pub enum ResumeFrom {
    Fresh,
    Latest,
    Path(PathBuf),
}

/// Loop progress persisted into every checkpoint and restored on resume.
/// `callbacks` is an opaque slot for stateful-callback snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: usize,
    #[serde(default)]
    pub callbacks: serde_json::Value,
}

impl TrainerState {
    pub fn fresh() -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            callbacks: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
    pub scaler: Option<FileRecord>,
    pub trainer: FileRecord,
}

pub struct SaveRequest<'a> {
    pub output_dir: &'a Path,
    pub model: &'a dyn TrainableModel,
    pub optimizer: &'a dyn Optimizer,
    pub scheduler: &'a dyn LrScheduler,
    pub scaler_state: Option<LossScalerState>,
    pub trainer_state: TrainerState,
    pub max_keep: Option<usize>,
}

pub struct LoadedCheckpoint {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub trainer_state: Option<TrainerState>,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: SchedulerState,
    pub scaler_state: Option<LossScalerState>,
    pub weights_path: PathBuf,
}

/// Writes `{output_dir}/checkpoint-{step}/`. Everything lands in a temp
/// directory first and is renamed into place, so a directory that exists is
/// always complete. The one loop operation allowed to block on disk I/O.
pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<PathBuf, TrainError> {
    fs::create_dir_all(request.output_dir)?;

    let step = request.trainer_state.global_step;
    let final_dir = request
        .output_dir
        .join(format!("{CHECKPOINT_PREFIX}{step}"));
    let staging_dir = request
        .output_dir
        .join(format!(".tmp-{CHECKPOINT_PREFIX}{step}"));
    if staging_dir.exists() {
        fs::remove_dir_all(&staging_dir)?;
    }
    fs::create_dir(&staging_dir)?;

    let model_path = staging_dir.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;
    let model_record = file_record(&model_path)?;

    let optimizer_path = staging_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let scheduler_path = staging_dir.join(SCHEDULER_FILENAME);
    write_json(&scheduler_path, &request.scheduler.snapshot())?;
    let scheduler_record = file_record(&scheduler_path)?;

    let scaler_record = match &request.scaler_state {
        Some(state) => {
            let scaler_path = staging_dir.join(SCALER_FILENAME);
            write_json(&scaler_path, state)?;
            Some(file_record(&scaler_path)?)
        }
        None => None,
    };

    let trainer_path = staging_dir.join(TRAINER_FILENAME);
    write_json(&trainer_path, &request.trainer_state)?;
    let trainer_record = file_record(&trainer_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        model: model_record,
        optimizer: optimizer_record,
        scheduler: scheduler_record,
        scaler: scaler_record,
        trainer: trainer_record,
    };
    write_json(&staging_dir.join(MANIFEST_FILENAME), &manifest)?;

    if final_dir.exists() {
        fs::remove_dir_all(&final_dir)?;
    }
    fs::rename(&staging_dir, &final_dir)?;

    prune_checkpoints(request.output_dir, request.max_keep)?;

    Ok(final_dir)
}

/// Highest-step `checkpoint-*` subdirectory, compared numerically.
pub fn latest_checkpoint(output_dir: &Path) -> Result<Option<PathBuf>, TrainError> {
    let mut best: Option<(usize, PathBuf)> = None;
    for (step, path) in checkpoint_directories(output_dir)? {
        if best.as_ref().is_none_or(|(s, _)| step > *s) {
            best = Some((step, path));
        }
    }
    Ok(best.map(|(_, path)| path))
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadedCheckpoint, TrainError> {
    let manifest: CheckpointManifest = read_json(&directory.join(MANIFEST_FILENAME))
        .map_err(|_| {
            TrainError::state(format!(
                "checkpoint manifest not readable at {}",
                directory.display()
            ))
        })?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainError::state(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }

    let weights_path = directory.join(&manifest.model.filename);
    validate_file(&weights_path, &manifest.model.sha256)?;

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    let scheduler_path = directory.join(&manifest.scheduler.filename);
    validate_file(&scheduler_path, &manifest.scheduler.sha256)?;
    let scheduler_state: SchedulerState = read_json(&scheduler_path)?;

    let scaler_state = match manifest.scaler.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(read_json(&path)?)
        }
        None => None,
    };

    let trainer_path = directory.join(&manifest.trainer.filename);
    let trainer_state = if trainer_path.is_file() {
        validate_file(&trainer_path, &manifest.trainer.sha256)?;
        Some(read_json(&trainer_path)?)
    } else {
        None
    };

    Ok(LoadedCheckpoint {
        directory: directory.to_path_buf(),
        manifest,
        trainer_state,
        optimizer_state,
        scheduler_state,
        scaler_state,
        weights_path,
    })
}

/// Loads checkpoint weights into the live model's `Var`s by name.
pub fn apply_model_weights(
    model: &dyn TrainableModel,
    weights_path: &Path,
) -> Result<(), TrainError> {
    let named = model.trainable_parameters();
    let device = match named.first() {
        Some((_, var)) => var.as_tensor().device().clone(),
        None => return Err(TrainError::state("model has no trainable parameters")),
    };

    let mut by_name: std::collections::HashMap<_, _> =
        load_safetensors(weights_path, &device)?.into_iter().collect();

    for (name, var) in named {
        let tensor = by_name
            .remove(&name)
            .ok_or_else(|| TrainError::state(format!("checkpoint missing parameter {name}")))?;
        let desired = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired {
            tensor
        } else {
            tensor.to_dtype(desired)?
        };
        var.set(&tensor)?;
    }

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(TrainError::state(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }

    Ok(())
}

fn save_model_weights(model: &dyn TrainableModel, path: &Path) -> Result<(), TrainError> {
    let named = model.trainable_parameters();
    if named.is_empty() {
        return Err(TrainError::state(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = std::collections::HashMap::with_capacity(named.len());
    for (name, var) in named {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

fn checkpoint_directories(output_dir: &Path) -> Result<Vec<(usize, PathBuf)>, TrainError> {
    let mut dirs = Vec::new();
    if !output_dir.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(step) = name
            .strip_prefix(CHECKPOINT_PREFIX)
            .and_then(|s| s.parse::<usize>().ok())
        {
            dirs.push((step, entry.path()));
        }
    }
    Ok(dirs)
}

fn prune_checkpoints(output_dir: &Path, max_keep: Option<usize>) -> Result<(), TrainError> {
    let Some(limit) = max_keep else {
        return Ok(());
    };
    if limit == 0 {
        return Ok(());
    }
    let mut dirs = checkpoint_directories(output_dir)?;
    dirs.sort_by_key(|(step, _)| *step);
    while dirs.len() > limit {
        let (_, victim) = dirs.remove(0);
        fs::remove_dir_all(&victim)?;
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainError::state(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn file_record(path: &Path) -> Result<FileRecord, TrainError> {
    let sha256 = sha256_file(path)?;
    let bytes = path.metadata()?.len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainError::state(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainError> {
    let mut file = File::create(path)?;
    let data = serde_json::to_vec_pretty(value)?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainError> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(|err| {
        TrainError::state(format!("failed to parse {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_checkpoint_compares_steps_numerically() {
        let tmp = tempfile::tempdir().unwrap();
        for step in [2usize, 10, 9] {
            fs::create_dir(tmp.path().join(format!("{CHECKPOINT_PREFIX}{step}"))).unwrap();
        }
        fs::create_dir(tmp.path().join("unrelated")).unwrap();

        let latest = latest_checkpoint(tmp.path()).unwrap().unwrap();
        assert!(latest.ends_with("checkpoint-10"));
    }

    #[test]
    fn latest_checkpoint_absent_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint(tmp.path()).unwrap().is_none());
        assert!(latest_checkpoint(&tmp.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn checksum_validation_rejects_tampering() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trainer-state.json");
        fs::write(&path, b"{}").unwrap();
        let record = file_record(&path).unwrap();
        fs::write(&path, b"{\"global_step\":7}").unwrap();
        assert!(validate_file(&path, &record.sha256).is_err());
    }
}
