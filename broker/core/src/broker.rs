use crate::{
    catalog::{self, CatalogService, Plan},
    charts::{ChartDeployer, ChartRepository},
    credentials::{BindContext, Providers},
    error::Error,
    operation::{self, Cancel, InstanceLocks, Tasks},
    params::Params,
    record::{
        BindingPayload, InstanceRecord, LastOperation, Operation, OperationState, RecordError,
        RecordPatch,
    },
    resources::ResourceStore,
    store::{RecordStore, StoreError},
    INSTANCE_LABEL,
};
use chart_broker_k8s_api::{cluster, labels, ResourceExt, Selector};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs the OSB verbs against a chart repository and a cluster.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// The namespace releases are installed into when a request does not name one.
    pub default_namespace: Option<String>,
    pub cluster_domain: String,
    /// Limits the catalog to charts with a registered credential provider.
    pub catalog_enabled_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub namespace: Option<String>,
    pub accepts_incomplete: bool,
    pub params: Params,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindRequest {
    pub instance_id: String,
    pub service_id: String,
    pub binding_id: String,
    pub accepts_incomplete: bool,
    pub params: Params,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BindResponse {
    /// Set when the binding completes in the background.
    pub operation: Option<String>,
    /// Set when the binding completed inline.
    pub payload: Option<BindingPayload>,
}

struct Inner {
    records: Arc<dyn RecordStore>,
    resources: Arc<dyn ResourceStore>,
    charts: Arc<dyn ChartRepository>,
    deployer: Arc<dyn ChartDeployer>,
    providers: Providers,
    config: Config,
    locks: InstanceLocks,
    tasks: Tasks,
}

/// How an instance operation ends when it did not fail.
#[derive(Debug)]
enum Completion {
    Succeeded(String),
    /// The instance is gone; its record is removed.
    Delete,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            default_namespace: None,
            cluster_domain: cluster::DEFAULT_DOMAIN.to_string(),
            catalog_enabled_only: false,
        }
    }
}

// === impl Broker ===

impl Broker {
    pub fn new(
        records: Arc<dyn RecordStore>,
        resources: Arc<dyn ResourceStore>,
        charts: Arc<dyn ChartRepository>,
        deployer: Arc<dyn ChartDeployer>,
        providers: Providers,
        config: Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                records,
                resources,
                charts,
                deployer,
                providers,
                config,
                locks: InstanceLocks::default(),
                tasks: Tasks::default(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub async fn catalog(&self) -> Result<Vec<CatalogService>, Error> {
        let index = self
            .inner
            .charts
            .charts()
            .await
            .map_err(|e| Error::upstream("failed to list charts", e))?;
        let only = self
            .inner
            .config
            .catalog_enabled_only
            .then_some(&self.inner.providers);
        Ok(catalog::build(&index, only))
    }

    /// Provisions an instance, returning an operation token when the deployment continues in the
    /// background.
    pub async fn provision(&self, req: ProvisionRequest) -> Result<Option<String>, Error> {
        let ProvisionRequest {
            instance_id: id,
            service_id,
            plan_id,
            namespace,
            accepts_incomplete,
            params,
        } = req;

        let namespace = namespace
            .filter(|ns| !ns.is_empty())
            .or_else(|| self.inner.config.default_namespace.clone())
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| {
                Error::Validation(format!("cannot provision instance {id}: empty namespace"))
            })?;
        let plan = self.plan(&service_id, &plan_id).await?;
        info!(instance = %id, service = %service_id, plan = %plan.id, %namespace, "Provisioning");

        let token = operation::token(operation::PROVISION);
        let mut record = InstanceRecord::new(&id, &service_id, &plan.id, params.clone());
        record.operation = Some(Operation::new(
            &token,
            OperationState::InProgress,
            format!("provisioning instance {id}"),
        ));
        let fields = record.to_fields().map_err(record_error(&id))?;
        // Registered while the record is locked so that a later verb on the instance sees it.
        let registration = {
            let _lock = self.inner.locks.lock(&id).await;
            match self.inner.records.create(&id, fields).await {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(_)) => return Err(Error::Conflict),
                Err(e) => return Err(store_error(&id, e)),
            }
            self.inner.tasks.register(id.clone(), token.clone())
        };

        if accepts_incomplete {
            let broker = self.clone();
            registration.spawn({
                let token = token.clone();
                move |cancel| async move {
                    let result = broker
                        .provision_release(&id, &service_id, &plan, &namespace, &params, &cancel)
                        .await;
                    if let Err(error) = &result {
                        warn!(instance = %id, %error, "Provisioning failed");
                    }
                    broker.finish(&id, &token, &result).await;
                }
            });
            return Ok(Some(token));
        }

        let cancel = registration.cancel();
        let (result, written) = registration
            .run(async {
                let result = self
                    .provision_release(&id, &service_id, &plan, &namespace, &params, &cancel)
                    .await;
                let written = self.complete(&id, &token, &result).await;
                (result, written)
            })
            .await;
        result?;
        written?;
        Ok(None)
    }

    /// Accepted for protocol compatibility; instances are never updated in place.
    pub async fn update(&self, instance_id: &str) -> Result<(), Error> {
        debug!(instance = %instance_id, "Ignoring update");
        Ok(())
    }

    pub async fn deprovision(
        &self,
        instance_id: &str,
        accepts_incomplete: bool,
    ) -> Result<Option<String>, Error> {
        let id = instance_id.to_string();
        let token = operation::token(operation::DEPROVISION);
        let registration = {
            let _lock = self.inner.locks.lock(&id).await;
            if self.record(&id).await?.is_none() {
                return Err(Error::Gone(format!("instance {id} does not exist")));
            }
            let prior = self.inner.tasks.cancel_instance(&id);
            let registration = self
                .inner
                .tasks
                .register(id.clone(), token.clone())
                .after(prior);
            let op = Operation::new(
                &token,
                OperationState::InProgress,
                format!("deprovisioning instance {id}"),
            );
            self.update_record(&id, RecordPatch::default().operation(&op))
                .await?;
            registration
        };
        info!(instance = %id, "Deprovisioning");

        if accepts_incomplete {
            let broker = self.clone();
            registration.spawn({
                let token = token.clone();
                move |cancel| async move {
                    let result = broker.remove_release(&id, &cancel).await;
                    if let Err(error) = &result {
                        warn!(instance = %id, %error, "Deprovisioning failed");
                    }
                    broker.finish(&id, &token, &result).await;
                }
            });
            return Ok(Some(token));
        }

        let cancel = registration.cancel();
        let (result, written) = registration
            .run(async {
                let result = self.remove_release(&id, &cancel).await;
                let written = self.complete(&id, &token, &result).await;
                (result, written)
            })
            .await;
        result?;
        written?;
        Ok(None)
    }

    pub async fn bind(&self, req: BindRequest) -> Result<BindResponse, Error> {
        let BindRequest {
            instance_id: id,
            service_id,
            binding_id,
            accepts_incomplete,
            params,
        } = req;

        let record = self
            .record(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {id} does not exist")))?;
        if !service_id.is_empty() && service_id != record.service_id {
            return Err(Error::Validation(format!(
                "instance {id} is not an instance of service {service_id}"
            )));
        }
        if let Some(payload) = record.binding(&binding_id).and_then(|b| b.payload.clone()) {
            debug!(instance = %id, binding = %binding_id, "Binding exists");
            return Ok(BindResponse {
                operation: None,
                payload: Some(payload),
            });
        }
        info!(instance = %id, binding = %binding_id, "Binding");

        if accepts_incomplete {
            let token = operation::token(operation::BIND);
            let registration = {
                let _lock = self.inner.locks.lock(&id).await;
                let state = LastOperation::new(
                    OperationState::InProgress,
                    format!("binding {binding_id} to instance {id}"),
                );
                let patch = RecordPatch::default()
                    .binding_state(&binding_id, &state)
                    .map_err(record_error(&id))?;
                self.update_record(&id, patch).await?;
                self.inner
                    .tasks
                    .register(operation::binding_key(&id, &binding_id), token.clone())
            };

            let broker = self.clone();
            registration.spawn(move |cancel| async move {
                let result = broker.bind_release(&record, &params, &cancel).await;
                if let Err(error) = &result {
                    warn!(instance = %id, binding = %binding_id, %error, "Binding failed");
                }
                if let Err(error) = broker
                    .complete_binding(&id, &binding_id, &result, &cancel)
                    .await
                {
                    warn!(instance = %id, binding = %binding_id, %error, "Failed to record binding state");
                }
            });
            return Ok(BindResponse {
                operation: Some(token),
                payload: None,
            });
        }

        let cancel = Cancel::never();
        let result = self.bind_release(&record, &params, &cancel).await;
        let written = self
            .complete_binding(&id, &binding_id, &result, &cancel)
            .await;
        let payload = result?;
        written?;
        Ok(BindResponse {
            operation: None,
            payload: Some(payload),
        })
    }

    /// Forgets a binding. Deployed resources are left untouched.
    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> Result<(), Error> {
        let _lock = self.inner.locks.lock(instance_id).await;
        let record = self
            .record(instance_id)
            .await?
            .ok_or_else(|| Error::Gone(format!("instance {instance_id} does not exist")))?;
        if record.binding(binding_id).is_none() {
            return Err(Error::Gone(format!(
                "binding {binding_id} of instance {instance_id} does not exist"
            )));
        }

        info!(instance = %instance_id, binding = %binding_id, "Unbinding");
        let _ = self
            .inner
            .tasks
            .cancel(&operation::binding_key(instance_id, binding_id));
        self.update_record(instance_id, RecordPatch::default().remove_binding(binding_id))
            .await
    }

    pub async fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<BindingPayload, Error> {
        let record = self
            .record(instance_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {instance_id} does not exist")))?;
        record
            .binding(binding_id)
            .and_then(|b| b.payload.clone())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "binding {binding_id} of instance {instance_id} does not exist"
                ))
            })
    }

    /// Reports the state of the instance's most recent operation.
    ///
    /// When `token` is set, it must name that operation; a superseded token is a conflict.
    pub async fn last_operation(
        &self,
        instance_id: &str,
        token: Option<&str>,
    ) -> Result<LastOperation, Error> {
        let record = self
            .record(instance_id)
            .await?
            .ok_or_else(|| Error::Gone(format!("instance {instance_id} does not exist")))?;
        match (&record.operation, token) {
            (Some(op), Some(token)) if op.name != token => Err(Error::Conflict),
            (Some(op), _) => Ok(LastOperation::from(op)),
            (None, Some(_)) => Err(Error::Conflict),
            (None, None) => Ok(LastOperation::new(OperationState::Succeeded, "")),
        }
    }

    pub async fn last_binding_operation(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<LastOperation, Error> {
        let record = self
            .record(instance_id)
            .await?
            .ok_or_else(|| Error::Gone(format!("instance {instance_id} does not exist")))?;
        record
            .binding(binding_id)
            .and_then(|b| b.state.clone())
            .ok_or_else(|| {
                Error::Gone(format!(
                    "binding {binding_id} of instance {instance_id} does not exist"
                ))
            })
    }

    async fn plan(&self, service_id: &str, plan_id: &str) -> Result<Plan, Error> {
        let index = self.inner.charts.charts().await.map_err(|e| {
            Error::upstream(format!("failed to list charts for service {service_id}"), e)
        })?;
        let service = index
            .get(service_id)
            .and_then(|versions| catalog::service(service_id, versions))
            .ok_or_else(|| Error::Validation(format!("unknown service {service_id:?}")))?;
        service.plan(plan_id).cloned().ok_or_else(|| {
            Error::Validation(format!(
                "unknown plan {plan_id:?} for service {service_id:?}"
            ))
        })
    }

    async fn provision_release(
        &self,
        id: &str,
        chart_name: &str,
        plan: &Plan,
        namespace: &str,
        values: &Params,
        cancel: &Cancel,
    ) -> Result<Completion, Error> {
        let version = &plan.chart.version;
        cancel.check()?;
        let chart = self
            .inner
            .charts
            .resolve_chart(chart_name, version)
            .await
            .map_err(|e| {
                Error::upstream(
                    format!("failed to resolve chart {chart_name}@{version} for instance {id}"),
                    e,
                )
            })?
            .ok_or_else(|| {
                Error::Validation(format!(
                    "chart {chart_name}@{version} not found for instance {id}"
                ))
            })?;

        let release = self
            .inner
            .deployer
            .deploy(&chart, namespace, values)
            .await
            .map_err(|e| {
                Error::upstream(
                    format!("failed to install chart {chart_name}@{version} for instance {id}"),
                    e,
                )
            })?;
        info!(instance = %id, release = %release.name, namespace = %release.namespace, "Installed chart");

        // The release must be recorded even if the operation is superseded, so that it can be
        // uninstalled.
        let recorded = {
            let _lock = self.inner.locks.lock(id).await;
            self.update_record(id, RecordPatch::default().release(&release.reference()))
                .await
        };
        if let Err(error) = recorded {
            if matches!(error, Error::Gone(_)) {
                warn!(instance = %id, release = %release.name, "Instance removed during install");
                if let Err(error) = self.inner.deployer.undeploy(&release.reference()).await {
                    warn!(instance = %id, release = %release.name, %error, "Failed to uninstall release");
                }
            }
            return Err(error);
        }

        cancel.check()?;
        for resource in &release.resources {
            debug!(instance = %id, %resource, "Labeling");
            self.inner
                .resources
                .patch_label(resource, INSTANCE_LABEL, id)
                .await
                .map_err(|e| {
                    Error::upstream(format!("failed to label {resource} for instance {id}"), e)
                })?;
        }

        Ok(Completion::Succeeded(format!("provisioned instance {id}")))
    }

    /// Uninstalls the instance's release, as recorded once prior operations have stopped.
    async fn remove_release(&self, id: &str, cancel: &Cancel) -> Result<Completion, Error> {
        cancel.check()?;
        let release = self.record(id).await?.and_then(|r| r.release);
        match release {
            Some(release) => {
                self.inner.deployer.undeploy(&release).await.map_err(|e| {
                    Error::upstream(
                        format!(
                            "failed to uninstall release {} for instance {id}",
                            release.name
                        ),
                        e,
                    )
                })?;
                info!(instance = %id, release = %release.name, "Uninstalled release");
            }
            None => debug!(instance = %id, "No release to uninstall"),
        }
        cancel.check()?;
        Ok(Completion::Delete)
    }

    async fn bind_release(
        &self,
        record: &InstanceRecord,
        bind_params: &Params,
        cancel: &Cancel,
    ) -> Result<BindingPayload, Error> {
        let id = &record.instance_id;
        let namespace = record
            .release
            .as_ref()
            .map(|r| r.namespace.as_str())
            .ok_or_else(|| Error::NotFound(format!("instance {id} has no deployed release")))?;
        let selector = Selector::from_map(labels::Map::from([(
            INSTANCE_LABEL.to_string(),
            id.to_string(),
        )]));

        let services = self
            .inner
            .resources
            .services(namespace, &selector)
            .await
            .map_err(|e| Error::upstream(format!("failed to list services for instance {id}"), e))?;
        if services.is_empty() {
            return Err(Error::NotFound(format!("no services found for instance {id}")));
        }
        let secrets = self
            .inner
            .resources
            .secrets(namespace, &selector)
            .await
            .map_err(|e| Error::upstream(format!("failed to list secrets for instance {id}"), e))?;
        if secrets.is_empty() {
            return Err(Error::NotFound(format!("no secrets found for instance {id}")));
        }

        let mut credentials = Params::default();
        for secret in &secrets {
            for (key, value) in secret.data.iter().flatten() {
                match String::from_utf8(value.0.clone()) {
                    Ok(value) => {
                        credentials.insert(key.clone(), value);
                    }
                    Err(_) => {
                        debug!(instance = %id, secret = %secret.name_any(), %key, "Skipping binary secret value");
                    }
                }
            }
        }

        if let Some(provider) = self.inner.providers.get(&record.service_id) {
            let params = record.provision_params.merge(bind_params);
            let ctx = BindContext {
                services: &services,
                bind_params,
                params: &params,
                secrets: &credentials,
                namespace,
                cluster_domain: &self.inner.config.cluster_domain,
            };
            let creds = provider.bind(&ctx).map_err(|source| Error::Provider {
                instance: id.clone(),
                source,
            })?;
            credentials.extend(creds.to_params());
        }

        cancel.check()?;
        Ok(BindingPayload {
            credentials,
            parameters: bind_params.clone(),
        })
    }

    /// Records the outcome of a background operation. Failures to do so are logged.
    async fn finish(&self, id: &str, token: &str, result: &Result<Completion, Error>) {
        if let Err(error) = self.complete(id, token, result).await {
            warn!(instance = %id, %token, %error, "Failed to record operation state");
        }
    }

    /// Writes the terminal state of the operation named `token`, unless the record has since
    /// moved on to another operation.
    async fn complete(
        &self,
        id: &str,
        token: &str,
        result: &Result<Completion, Error>,
    ) -> Result<(), Error> {
        if let Err(Error::Superseded(_)) = result {
            debug!(instance = %id, %token, "Operation superseded");
            return Ok(());
        }

        let _lock = self.inner.locks.lock(id).await;
        let Some(record) = self.record(id).await? else {
            debug!(instance = %id, %token, "Instance removed");
            return Ok(());
        };
        match &record.operation {
            Some(op) if op.name == token && !op.state.is_terminal() => {}
            op => {
                debug!(
                    instance = %id,
                    %token,
                    current = ?op.as_ref().map(|op| &op.name),
                    "Operation no longer current",
                );
                return Ok(());
            }
        }

        let op = match result {
            Ok(Completion::Delete) => {
                return match self.inner.records.delete(id).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => {
                        info!(instance = %id, "Deprovisioned");
                        Ok(())
                    }
                    Err(e) => Err(store_error(id, e)),
                };
            }
            Ok(Completion::Succeeded(description)) => {
                Operation::new(token, OperationState::Succeeded, description.clone())
            }
            Err(error) => Operation::new(token, OperationState::Failed, error.description()),
        };
        self.update_record(id, RecordPatch::default().operation(&op))
            .await
    }

    /// Persists the payload and state of a binding in a single write.
    async fn complete_binding(
        &self,
        id: &str,
        binding_id: &str,
        result: &Result<BindingPayload, Error>,
        cancel: &Cancel,
    ) -> Result<(), Error> {
        let patch = match result {
            Err(Error::Superseded(_)) => {
                debug!(instance = %id, binding = %binding_id, "Binding superseded");
                return Ok(());
            }
            Ok(payload) => RecordPatch::default()
                .binding(binding_id, payload)
                .and_then(|p| {
                    p.binding_state(
                        binding_id,
                        &LastOperation::new(OperationState::Succeeded, ""),
                    )
                }),
            Err(error) => RecordPatch::default().remove_binding(binding_id).binding_state(
                binding_id,
                &LastOperation::new(OperationState::Failed, error.description()),
            ),
        }
        .map_err(record_error(id))?;

        // Unbinding cancels the operation while holding the lock, so a binding removed since
        // the operation's last check is not written back.
        let _lock = self.inner.locks.lock(id).await;
        if cancel.is_cancelled() {
            debug!(instance = %id, binding = %binding_id, "Binding superseded");
            return Ok(());
        }
        self.update_record(id, patch).await
    }

    async fn record(&self, id: &str) -> Result<Option<InstanceRecord>, Error> {
        let fields = self
            .inner
            .records
            .get(id)
            .await
            .map_err(|e| store_error(id, e))?;
        fields
            .map(|fields| InstanceRecord::from_fields(id, &fields))
            .transpose()
            .map_err(record_error(id))
    }

    async fn update_record(&self, id: &str, patch: RecordPatch) -> Result<(), Error> {
        self.inner
            .records
            .update(id, patch.into_inner())
            .await
            .map_err(|e| store_error(id, e))
    }
}

fn store_error(id: &str, error: StoreError) -> Error {
    match error {
        StoreError::NotFound(_) => Error::Gone(format!("instance {id} does not exist")),
        StoreError::AlreadyExists(_) => Error::Conflict,
        StoreError::Other(e) => Error::upstream(format!("failed to access record of instance {id}"), e),
    }
}

fn record_error(id: &str) -> impl Fn(RecordError) -> Error + '_ {
    move |source| Error::Record {
        instance: id.to_string(),
        source,
    }
}
