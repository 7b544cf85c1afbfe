//! Work performed while an experiment is `initializing`
//!
//! Steps run in order and stop at the first failure:
//! 1. validate both pipeline templates
//! 2. render a configuration per variant
//! 3. deploy both variants and register them in the deployment store
//! 4. wait, bounded per variant, until the aggregator reports both ready

use super::machine::Context;
use crate::controller::clients::ClientError;
use crate::model::{deployment_id, Deployment, DeploymentSpec, Experiment, Variant};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const VARIANTS: [Variant; 2] = [Variant::Baseline, Variant::Candidate];

/// Template parameter holding the expected instance count per variant
pub const INSTANCES_PARAMETER: &str = "instances";

#[derive(Debug, Error, PartialEq)]
pub enum ProvisioningError {
    #[error("template validation failed for {pipeline}: {reason}")]
    ValidationFailed { pipeline: String, reason: String },

    #[error("config generation failed for {variant}: {reason}")]
    ConfigGenerationFailed { variant: Variant, reason: String },

    #[error("deployment of {variant} failed: {reason}")]
    DeploymentFailed { variant: Variant, reason: String },

    #[error("{variant} deployment not ready after {timeout:?}")]
    DeploymentTimeout { variant: Variant, timeout: Duration },
}

/// Provision both variants of `experiment`
pub async fn provision(ctx: &Context, experiment: &Experiment) -> Result<(), ProvisioningError> {
    let config = &experiment.config;

    for variant in VARIANTS {
        let pipeline = variant.pipeline(config);
        bounded(ctx, ctx.templates.validate_template(pipeline, &config.parameters))
            .await
            .map_err(|e| ProvisioningError::ValidationFailed {
                pipeline: pipeline.to_string(),
                reason: e.to_string(),
            })?;
        debug!(experiment = %experiment.id, pipeline = %pipeline, "Template valid");
    }

    let mut rendered = Vec::with_capacity(VARIANTS.len());
    for variant in VARIANTS {
        let config_text = bounded(
            ctx,
            ctx.templates
                .generate_config(variant.pipeline(config), variant, &config.parameters),
        )
        .await
        .map_err(|e| ProvisioningError::ConfigGenerationFailed {
            variant,
            reason: e.to_string(),
        })?;
        rendered.push((variant, config_text));
    }

    for (variant, config_text) in rendered {
        deploy_variant(ctx, experiment, variant, config_text).await?;
    }

    let (baseline, candidate) = tokio::join!(
        wait_until_ready(ctx, experiment, Variant::Baseline),
        wait_until_ready(ctx, experiment, Variant::Candidate),
    );
    baseline?;
    candidate?;

    info!(experiment = %experiment.id, "Both variants deployed and ready");
    Ok(())
}

async fn deploy_variant(
    ctx: &Context,
    experiment: &Experiment,
    variant: Variant,
    config_text: String,
) -> Result<(), ProvisioningError> {
    let id = deployment_id(&experiment.id, variant);
    let pipeline = variant.pipeline(&experiment.config).to_string();
    let failed = |reason: String| ProvisioningError::DeploymentFailed { variant, reason };

    let spec = DeploymentSpec {
        deployment_id: id.clone(),
        experiment_id: experiment.id.clone(),
        variant,
        pipeline: pipeline.clone(),
        namespace: ctx.settings.namespace.clone(),
        node_selector: experiment.config.target_nodes.clone(),
        config: config_text,
    };
    bounded(ctx, ctx.execution.deploy_pipeline(&spec))
        .await
        .map_err(|e| failed(e.to_string()))?;

    let deployment = Deployment {
        id: id.clone(),
        name: format!("{}-{}", experiment.name, variant),
        experiment_id: experiment.id.clone(),
        variant,
        pipeline,
        namespace: ctx.settings.namespace.clone(),
        desired_instances: desired_instances(experiment),
        ready_instances: 0,
        updated_instances: 0,
        instances: vec![],
        created_at: ctx.clock.now(),
    };
    ctx.store
        .put_deployment(&deployment)
        .await
        .map_err(|e| failed(e.to_string()))?;

    info!(experiment = %experiment.id, deployment = %id, "Variant deployed");
    Ok(())
}

/// Readiness gate for one variant, bounded by the readiness timeout
async fn wait_until_ready(
    ctx: &Context,
    experiment: &Experiment,
    variant: Variant,
) -> Result<(), ProvisioningError> {
    let timeout = ctx.settings.readiness_timeout;
    let id = deployment_id(&experiment.id, variant);

    let gate = async {
        ctx.execution
            .wait_for_ready(&experiment.id, variant, &ctx.settings.namespace, timeout)
            .await
            .map_err(|e| match e {
                ClientError::Timeout(_) => ProvisioningError::DeploymentTimeout { variant, timeout },
                other => ProvisioningError::DeploymentFailed {
                    variant,
                    reason: other.to_string(),
                },
            })?;

        loop {
            match ctx.aggregator.get_aggregated_status(&id).await {
                Ok(status) if status.is_ready() => return Ok(()),
                Ok(status) => debug!(
                    deployment = %id,
                    status = ?status.status,
                    issues = ?status.health_summary.issues,
                    "Waiting for deployment readiness"
                ),
                Err(e) => {
                    return Err(ProvisioningError::DeploymentFailed {
                        variant,
                        reason: e.to_string(),
                    })
                }
            }
            tokio::time::sleep(ctx.settings.readiness_poll_interval).await;
        }
    };

    tokio::time::timeout(timeout, gate)
        .await
        .map_err(|_| ProvisioningError::DeploymentTimeout { variant, timeout })?
}

fn desired_instances(experiment: &Experiment) -> u32 {
    experiment
        .config
        .parameters
        .get(INSTANCES_PARAMETER)
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
}

/// Apply the per-call deadline to one client call
async fn bounded<T>(
    ctx: &Context,
    call: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    let limit = ctx.settings.call_timeout;
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ClientError::Timeout(limit))?
}
