pub mod skip;

use std::sync::Arc;
use std::time::Duration;

use image_verifier::cache::CachedEntry;
use image_verifier::config::ConfigError;
use image_verifier::image::Image;
use image_verifier::policy::{PolicyError, ValidationMode};
use image_verifier::validators::ValidationError;
use image_verifier::workload::{ContainerSlot, WorkloadObject};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::state::AppState;
use crate::{metrics, settings};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("invalid image reference")]
    InvalidImageReference,
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Static(ValidationError),
    #[error("error during {kind} validation of image {image}: {source}")]
    Validation {
        kind: &'static str,
        image: String,
        #[source]
        source: ValidationError,
    },
    #[error("validated image reference {reference} has invalid format: {reason}")]
    MalformedResult { reference: String, reason: String },
    #[error("{0}")]
    Cached(String),
}

/// Work order for one unique image of the workload.
#[derive(Debug, Clone)]
pub struct ValidationInput {
    pub slots: Vec<ContainerSlot>,
    pub image: String,
    pub previous_images: Vec<String>,
}

/// Result of one validation task.
#[derive(Debug, Default)]
pub struct ValidationOutput {
    pub slots: Vec<ContainerSlot>,
    pub raw_image: String,
    pub new_image: String,
    pub old_image: String,
    pub error: Option<TaskError>,
    pub validator: String,
    pub skipped: bool,
    pub skip_reason: String,
    pub validation_mode: ValidationMode,
}

/// Spawns one validation task per unique image of the new workload and
/// returns the result channel, sized to the task count.
pub fn validate_workload_object(
    state: Arc<AppState>,
    token: CancellationToken,
    new_workload: Arc<WorkloadObject>,
    old_workload: &WorkloadObject,
) -> (mpsc::Receiver<ValidationOutput>, usize) {
    let containers = new_workload.consolidated_containers();
    let previous_images = old_workload.image_set();
    let capacity = containers.len();

    let (tx, rx) = mpsc::channel(capacity.max(1));

    for (image, slots) in containers {
        let input = ValidationInput {
            slots,
            image,
            previous_images: previous_images.clone(),
        };
        tokio::spawn(validate_image(
            state.clone(),
            token.clone(),
            new_workload.clone(),
            input,
            tx.clone(),
        ));
    }

    (rx, capacity)
}

/// Validates a single image: policy match, skip evaluation, validator
/// call, cache write. Writes exactly one result to the channel unless
/// the request was cancelled first.
pub async fn validate_image(
    state: Arc<AppState>,
    token: CancellationToken,
    workload: Arc<WorkloadObject>,
    input: ValidationInput,
    out: mpsc::Sender<ValidationOutput>,
) {
    let mut output = ValidationOutput {
        slots: input.slots.clone(),
        raw_image: input.image.clone(),
        ..Default::default()
    };

    let image = match Image::new(&input.image) {
        Ok(image) => image,
        Err(_) => {
            output.error = Some(TaskError::InvalidImageReference);
            return record_and_send(output, "unknown", "", &token, &out);
        }
    };

    let rule = match state.config.matching_rule(&image.name()) {
        Ok(rule) => rule,
        Err(e) => {
            output.error = Some(e.into());
            return record_and_send(output, "unknown", "", &token, &out);
        }
    };
    debug!(
        rule = rule.pattern.as_str(),
        image = image.name().as_str(),
        "matched rule"
    );

    let validator = match state.config.validator(&rule.validator) {
        Ok(validator) => validator,
        Err(e) => {
            output.error = Some(e.into());
            return record_and_send(output, "unknown", "", &token, &out);
        }
    };
    let validator_kind = validator.kind();
    let validator_name = validator.name().to_string();
    output.validator = validator_name.clone();
    output.validation_mode = rule.with.validation_mode();
    debug!(validator = validator_name.as_str(), "resolved validator");

    let work = run_validation(&state, &token, &workload, &input, image, &rule, validator);
    let output = tokio::select! {
        _ = token.cancelled() => {
            metrics::inc_validations_timeouted(validator_kind, &validator_name);
            return;
        }
        result = work => {
            let mut output = output;
            let (error, skipped, skip_reason, old_image, new_image) = result;
            output.error = error;
            output.skipped = skipped;
            output.skip_reason = skip_reason;
            output.old_image = old_image;
            output.new_image = new_image;
            output
        }
    };

    record_and_send(output, validator_kind, &validator_name, &token, &out);
}

type RunResult = (Option<TaskError>, bool, String, String, String);

async fn run_validation(
    state: &Arc<AppState>,
    token: &CancellationToken,
    workload: &Arc<WorkloadObject>,
    input: &ValidationInput,
    mut image: Image,
    rule: &image_verifier::policy::Rule,
    validator: &image_verifier::validators::Validator,
) -> RunResult {
    // static validators run directly, the cache is not consulted
    if validator.is_static() {
        return match validator.validate(token, &image, &rule.with).await {
            Ok(digest) => {
                info!(
                    image = image.original_string(),
                    rule = rule.pattern.as_str(),
                    "static allow"
                );
                let old_image = image.name();
                let new_image = image.set_digest(&digest).name();
                (None, false, String::new(), old_image, new_image)
            }
            Err(e) => {
                info!(
                    image = image.original_string(),
                    rule = rule.pattern.as_str(),
                    "static deny"
                );
                (
                    Some(TaskError::Static(e)),
                    false,
                    String::new(),
                    String::new(),
                    String::new(),
                )
            }
        };
    }

    let decision = skip::evaluate(
        state.cache.as_ref(),
        state.kube_client.as_ref(),
        workload,
        &image,
        &input.previous_images,
    )
    .await;
    if decision.skip {
        info!(
            reason = decision.reason.as_str(),
            image = image.original_string(),
            "skipped validation"
        );
        let old_image = image.name();
        let new_image = image.set_digest(&decision.digest).name();
        return (
            decision.cached_error.map(TaskError::Cached),
            true,
            decision.reason,
            old_image,
            new_image,
        );
    }

    match validator.validate(token, &image, &rule.with).await {
        Ok(digest) => {
            let old_image = image.name();
            let new_image = image.set_digest(&digest).name();
            info!(
                image = image.original_string(),
                rule = rule.pattern.as_str(),
                validator = validator.name(),
                result = new_image.as_str(),
                "successfully validated image"
            );
            if !image.digest().is_empty() {
                write_cache_entry(state, &image, String::new()).await;
            }
            (None, false, String::new(), old_image, new_image)
        }
        Err(e) => {
            let error = TaskError::Validation {
                kind: validator.kind(),
                image: image.original_string().to_string(),
                source: e,
            };
            if settings::cache_errors() {
                // clear the digest for clearer caching entries
                image.set_digest("");
                write_cache_entry(state, &image, error.to_string()).await;
            }
            (Some(error), false, String::new(), String::new(), String::new())
        }
    }
}

async fn write_cache_entry(state: &Arc<AppState>, image: &Image, error: String) {
    let entry = CachedEntry {
        digest: image.digest().to_string(),
        error,
    };
    let value = match serde_json::to_string(&entry) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "error encoding cache entry");
            return;
        }
    };

    let ttl = Duration::from_secs(settings::cache_expiry_seconds().max(0) as u64);
    if let Err(e) = state
        .cache
        .set(image.original_string(), value, ttl)
        .await
    {
        warn!(error = %e, "error caching digest");
    }
}

/// Applies the post-validation format check and the per-task metrics,
/// then reports the result. A task that saw the cancellation fires the
/// timeout counter and stays silent, the receiver is gone.
fn record_and_send(
    mut output: ValidationOutput,
    validator_kind: &str,
    validator_name: &str,
    token: &CancellationToken,
    out: &mpsc::Sender<ValidationOutput>,
) {
    if output.error.is_none() {
        if let Err(e) = Image::new(&output.new_image) {
            output.error = Some(TaskError::MalformedResult {
                reference: output.new_image.clone(),
                reason: e.to_string(),
            });
        }
    }

    if token.is_cancelled() {
        metrics::inc_validations_timeouted(validator_kind, validator_name);
        return;
    }

    match &output.error {
        None => metrics::inc_validations_successful(validator_kind, validator_name),
        Some(_) => metrics::inc_validations_failed(validator_kind, validator_name),
    }
    if output.skipped {
        metrics::inc_validations_skipped(validator_kind, validator_name, &output.skip_reason);
    }

    let _ = out.try_send(output);
}
