//! # Pipeline
//!
//! Provisioning, image publishing, deployment and teardown for the crm/web
//! data pipeline producers running on AWS Fargate.
//!
//! ## Concepts
//!
//! Every piece of infrastructure is described as a [`Resource`]: a local
//! definition in code with a deterministic name, and a remote output that
//! exists on the platform (an ARN, an id, a URL).
//!
//! Resources are declared in a [`Store`]. Declarations return handles whose
//! [`StoreResource::remote`] values can be used in the definitions of later
//! resources. Those references become edges in a directed acyclic graph,
//! which the store schedules into ordered batches with [`Store::plan`] and
//! runs with [`Store::apply`].
//!
//! There is no state file. Each run re-derives the state of every resource
//! by reading it from the platform by name:
//!
//! - **ensure** ([`Store::resource`]) reads the resource, creates it when it
//!   is absent and leaves it alone (or updates it, see
//!   [`Resource::UPDATE_EXISTING`]) when it exists.
//! - **lookup** ([`Store::lookup`]) reads the resource and fails when it is
//!   absent.
//! - **destroy** ([`Store::destroy`]) reads the resource and deletes it when
//!   it exists.
//!
//! The first failing node aborts the run. Nodes that already ran are not
//! rolled back.
//!
//! ## Error Handling
//!
//! The engine reports errors with [`Error`]. Resource implementations choose
//! their own error type, which the engine boxes into the `Create`, `Read`,
//! `Update` and `Destroy` variants.

use std::{future::Future, ops::Deref, pin::Pin};

use snafu::prelude::*;

pub mod aws;
pub mod config;
pub mod names;
pub mod ops;
pub mod remote;
pub mod template;
pub mod wait;

use remote::{Remote, RemoteVar, Remotes};

/// Marker trait for userland errors.
pub trait UserError: core::fmt::Display + core::fmt::Debug + Send + Sync + 'static {}
impl<T: core::fmt::Display + core::fmt::Debug + Send + Sync + 'static> UserError for T {}

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{source}:\n{}",
                source.chain()
                    .map(|e| format!("{e}"))
                    .collect::<Vec<_>>()
                    .join("\n -> ")))]
    Pipeline { source: anyhow::Error },

    #[snafu(display("Could not build schedule: {msg}"))]
    Schedule { msg: String },

    #[snafu(display("Remote value of {ty:?} is unresolved. Depends on {depends_on}"))]
    RemoteUnresolved {
        ty: &'static str,
        depends_on: String,
    },

    #[snafu(display("Could not find a resource by the name '{name}'"))]
    MissingResource { name: String },

    #[snafu(display("A resource named '{name}' has already been declared"))]
    Duplicate { name: String },

    #[snafu(display("Error during '{name}' creation: {error}"))]
    Create {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' read: {error}"))]
    Read {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' update: {error}"))]
    Update {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' destruction: {error}"))]
    Destroy {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("'{name}' does not exist on the platform"))]
    NotFound { name: String },

    #[snafu(display("Could not downcast"))]
    Downcast,

    #[snafu(display("Could not read config file {path:?}: {source}"))]
    ReadConfig {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not parse config file {path:?}: {source}"))]
    ParseConfig {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("Could not read task definition template {path:?}: {source}"))]
    ReadTemplate {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "Task definition template '{template}' has unresolved placeholders: {}",
        placeholders.join(", ")
    ))]
    UnresolvedPlaceholder {
        template: String,
        placeholders: Vec<String>,
    },

    #[snafu(display("Rendered task definition '{template}' is not valid: {source}"))]
    ParseTemplate {
        template: String,
        source: serde_json::Error,
    },
}

impl From<anyhow::Error> for Error {
    fn from(source: anyhow::Error) -> Self {
        Error::Pipeline { source }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// IaC resources.
///
/// Represents a resource on a platform, identified by a deterministic name.
#[allow(unreachable_code)]
pub trait Resource: core::fmt::Debug + Clone + HasDependencies + 'static {
    /// Type of the platform/resource provider.
    ///
    /// For example [`aws::AwsContext`] in the case of amazon web services.
    type Provider;

    /// Errors that may occur interacting with the provider.
    type Error: UserError;

    /// The remote type of this resource, which we can used to fill in
    /// [`Remote`] values in other resources.
    type Output: core::fmt::Debug + Clone + 'static;

    /// Whether an ensure of an existing resource calls [`Resource::update`].
    ///
    /// When `false` an existing resource is loaded as-is, without any
    /// reconciliation of its configuration.
    const UPDATE_EXISTING: bool = false;

    /// Reads the current state of the resource from the platform.
    ///
    /// Returns `None` when no resource by this name exists.
    fn read(
        &self,
        provider: &Self::Provider,
    ) -> impl Future<Output = Result<Option<Self::Output>, Self::Error>>;

    /// Creates a new resource on the platform.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` so lookup-only resources
    /// only need to implement [`Resource::read`]. Ensuring such a resource
    /// when it is absent will panic.
    fn create(
        &self,
        _provider: &Self::Provider,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::create is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Updates an existing resource on the platform.
    ///
    /// Only called when [`Resource::UPDATE_EXISTING`] is `true`. The default
    /// returns the previous remote value unchanged.
    fn update(
        &self,
        _provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        let output = previous_remote.clone();
        async move { Ok(output) }
    }

    /// Deletes a resource from the platform.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    fn delete(
        &self,
        _provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<(), Self::Error>> {
        unimplemented!(
            "Resource::delete is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }
}

#[derive(Clone, Default, Debug)]
pub struct Dependencies {
    /// Specifies a dependency on a `Resource`.
    inner: Vec<String>,
}

impl IntoIterator for Dependencies {
    type Item = String;

    type IntoIter = <Vec<String> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl core::fmt::Display for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.join(", "))
    }
}

impl Dependencies {
    pub fn merge(self, other: Self) -> Self {
        Dependencies {
            inner: [self.inner, other.inner].concat(),
        }
    }
}

/// Tracks dependencies between resources.
///
/// The default implementation reports zero dependencies. Resources holding
/// [`Remote`] fields merge the dependencies of each of them.
pub trait HasDependencies {
    fn dependencies(&self) -> Dependencies {
        Dependencies::default()
    }
}

impl HasDependencies for String {}

impl<T: HasDependencies> HasDependencies for Vec<T> {
    fn dependencies(&self) -> Dependencies {
        self.iter().fold(Dependencies::default(), |acc, item| {
            acc.merge(item.dependencies())
        })
    }
}

impl<T: HasDependencies> HasDependencies for Option<T> {
    fn dependencies(&self) -> Dependencies {
        self.as_ref()
            .map(HasDependencies::dependencies)
            .unwrap_or_default()
    }
}

/// The declared intent for a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Create when absent, keep (or update) when present.
    Ensure,
    /// Must already exist.
    Lookup,
    /// Delete when present.
    Destroy,
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Ensure => "ensure",
            Action::Lookup => "lookup",
            Action::Destroy => "destroy",
        })
    }
}

/// What actually happened to a resource during [`Store::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Loaded,
    Updated,
    Read,
    Destroyed,
    Absent,
}

impl core::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Outcome::Created => "created",
            Outcome::Loaded => "already exists",
            Outcome::Updated => "updated",
            Outcome::Read => "read",
            Outcome::Destroyed => "destroyed",
            Outcome::Absent => "already absent",
        })
    }
}

/// The outcome of one node of an applied plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub id: String,
    pub outcome: Outcome,
}

#[derive(Clone, Debug)]
pub struct StoreResource<L, R> {
    /// Local definition in _code_
    local_definition: L,
    action: Action,
    remote_var: RemoteVar<R>,
}

impl<L, R> Deref for StoreResource<L, R> {
    type Target = L;

    fn deref(&self) -> &Self::Target {
        &self.local_definition
    }
}

impl<T> StoreResource<T, T::Output>
where
    T: Resource,
{
    /// Map a remote value to use in local definitions.
    pub fn remote<X: Clone + core::fmt::Debug + 'static>(
        &self,
        f: impl Fn(&T::Output) -> X + 'static,
    ) -> Remote<X> {
        Remote::new(self, f)
    }

    /// The declared action.
    pub fn action(&self) -> Action {
        self.action
    }
}

type StoreNodeRunFn<Provider> = Box<
    dyn FnOnce(
        // Resource platform provider
        &'_ Provider,
    ) -> Pin<Box<dyn Future<Output = Result<Outcome>> + '_>>,
>;

struct RunAction<'a, Provider, T: Resource<Provider = Provider>> {
    provider: &'a Provider,
    resource_id: String,
    action: Action,
    local_definition: T,
    remote_var: RemoteVar<T::Output>,
}

impl<Provider, T: Resource<Provider = Provider>> RunAction<'_, Provider, T> {
    async fn read(&self) -> Result<Option<T::Output>> {
        self.local_definition
            .read(self.provider)
            .await
            .map_err(|error| Error::Read {
                name: self.resource_id.clone(),
                error: Box::new(error),
            })
    }

    async fn run(self) -> Result<Outcome> {
        let action = self.action;
        let resource_id = self.resource_id.clone();
        log::info!("{action} '{resource_id}':");

        let outcome = match action {
            Action::Ensure => match self.read().await? {
                None => {
                    let output = self
                        .local_definition
                        .create(self.provider)
                        .await
                        .map_err(|error| Error::Create {
                            name: resource_id.clone(),
                            error: Box::new(error),
                        })?;
                    log::debug!("  {output:?}");
                    self.remote_var.set(Some(output));
                    Outcome::Created
                }
                Some(previous) if T::UPDATE_EXISTING => {
                    let output = self
                        .local_definition
                        .update(self.provider, &previous)
                        .await
                        .map_err(|error| Error::Update {
                            name: resource_id.clone(),
                            error: Box::new(error),
                        })?;
                    self.remote_var.set(Some(output));
                    Outcome::Updated
                }
                Some(previous) => {
                    self.remote_var.set(Some(previous));
                    Outcome::Loaded
                }
            },
            Action::Lookup => {
                let output = self.read().await?.context(NotFoundSnafu {
                    name: resource_id.clone(),
                })?;
                self.remote_var.set(Some(output));
                Outcome::Read
            }
            Action::Destroy => match self.read().await? {
                None => Outcome::Absent,
                Some(previous) => {
                    self.local_definition
                        .delete(self.provider, &previous)
                        .await
                        .map_err(|error| Error::Destroy {
                            name: resource_id.clone(),
                            error: Box::new(error),
                        })?;
                    Outcome::Destroyed
                }
            },
        };
        log::info!("  {outcome}");
        Ok(outcome)
    }
}

pub(crate) struct StoreNode<Provider> {
    id: String,
    action: Action,
    run: StoreNodeRunFn<Provider>,
}

/// A single planned action for a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedAction {
    /// The resource ID.
    pub id: String,
    /// The action to be taken.
    pub action: Action,
    /// The Rust type name of the resource.
    pub type_name: &'static str,
}

impl PlannedAction {
    /// The type name without its module path.
    pub fn short_type_name(&self) -> &'static str {
        self.type_name
            .rsplit_once("::")
            .map(|(_, ty)| ty)
            .unwrap_or(self.type_name)
    }
}

/// A plan of actions produced by [`Store::plan`].
///
/// Inspect the plan before passing it to [`Store::apply`] to execute.
pub struct Plan<Provider> {
    /// The planned actions, in execution order.
    pub actions: Vec<PlannedAction>,
    batches: Vec<Vec<dagga::Node<StoreNode<Provider>, usize>>>,
}

impl<Provider> Plan<Provider> {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// The number of batches the plan runs in.
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

impl<Provider> core::fmt::Display for Plan<Provider> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            f.write_str("No changes.\n")?;
            return Ok(());
        }
        for action in &self.actions {
            writeln!(
                f,
                "  {} '{}' [{}]",
                action.action,
                action.id,
                action.short_type_name()
            )?;
        }
        Ok(())
    }
}

pub struct Store<T> {
    provider: T,
    remotes: Remotes,
    graph: dagga::Dag<StoreNode<T>, usize>,
    declared: Vec<PlannedAction>,
}

impl<P: 'static> Store<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            remotes: Default::default(),
            graph: Default::default(),
            declared: Default::default(),
        }
    }

    /// Returns a reference to the provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn define_resource<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
        action: Action,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        let id = id.as_ref();
        snafu::ensure!(
            self.remotes.get(id).is_none(),
            DuplicateSnafu { name: id.to_owned() }
        );

        // Destroy nodes are ordered by the caller, so their references are
        // not resolved.
        let reads = if action == Action::Destroy {
            vec![]
        } else {
            let mut reads = vec![];
            for dep in local_definition.dependencies() {
                let var = self
                    .remotes
                    .get(&dep)
                    .context(MissingResourceSnafu { name: dep })?;
                reads.push(var.key);
            }
            reads.sort_unstable();
            reads.dedup();
            reads
        };

        let (remote_var, rez, ty) =
            self.remotes
                .dequeue_var::<T::Output>(id, action, std::any::type_name::<T>())?;

        let run: StoreNodeRunFn<T::Provider> = Box::new({
            let resource_id = id.to_owned();
            let remote_var = remote_var.clone();
            let local_definition = local_definition.clone();
            move |provider: &T::Provider| {
                Box::pin(
                    RunAction {
                        provider,
                        resource_id,
                        action,
                        local_definition,
                        remote_var,
                    }
                    .run(),
                )
            }
        });

        let node_name = format!("{action} {id}");
        log::debug!("adding node {node_name} with result {rez}");
        let dag_node = dagga::Node::new(StoreNode {
            id: id.to_owned(),
            action,
            run,
        })
        .with_name(node_name)
        .with_reads(reads)
        .with_result(rez);
        self.graph.add_node(dag_node);
        self.declared.push(PlannedAction {
            id: id.to_owned(),
            action,
            type_name: ty,
        });

        Ok(StoreResource {
            local_definition,
            action,
            remote_var,
        })
    }

    /// Declares a resource that should exist.
    ///
    /// At apply time the resource is read by name; it is created when
    /// absent.
    ///
    /// ## Errors
    /// Errs if `local_definition` references a resource that has not been
    /// declared, or if `id` is already declared.
    pub fn resource<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.define_resource(id, local_definition, Action::Ensure)
    }

    /// Declares a resource that must already exist.
    ///
    /// Applying fails with [`Error::NotFound`] when it does not.
    pub fn lookup<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.define_resource(id, local_definition, Action::Lookup)
    }

    /// Declares a resource to delete if it exists.
    pub fn destroy<T>(&mut self, id: impl AsRef<str>, local_definition: T) -> Result<(), Error>
    where
        T: Resource<Provider = P>,
    {
        let _ = self.define_resource(id, local_definition, Action::Destroy)?;
        Ok(())
    }

    /// Schedule every declared node into a [`Plan`].
    ///
    /// The store is drained of its declarations.
    pub fn plan(&mut self) -> Result<Plan<P>> {
        let graph = std::mem::take(&mut self.graph);
        let mut actions = std::mem::take(&mut self.declared);
        self.remotes = Default::default();

        let batches = if graph.is_empty() {
            vec![]
        } else {
            graph
                .build_schedule()
                .map_err(|e| Error::Schedule { msg: e.to_string() })?
                .batches
        };

        // Reorder actions to match the schedule's execution order.
        let mut ordered_actions = Vec::with_capacity(actions.len());
        for batch in &batches {
            for node in batch {
                let id = &node.inner().id;
                if let Some(pos) = actions.iter().position(|a| &a.id == id) {
                    ordered_actions.push(actions.remove(pos));
                }
            }
        }
        ordered_actions.extend(actions);

        Ok(Plan {
            actions: ordered_actions,
            batches,
        })
    }

    /// Execute a plan previously built by [`Store::plan`].
    ///
    /// Batches run in order and nodes within a batch run one after another.
    /// The first error aborts the run.
    pub async fn apply(&self, plan: Plan<P>) -> Result<Vec<Applied>> {
        let mut applied = vec![];
        for (i, batch) in plan.batches.into_iter().enumerate() {
            for (j, node) in batch.into_iter().enumerate() {
                let store_node = node.into_inner();
                log::debug!(
                    "applying node {j} ({} {}), batch {i}",
                    store_node.action,
                    store_node.id
                );
                let outcome = (store_node.run)(&self.provider).await?;
                applied.push(Applied {
                    id: store_node.id,
                    outcome,
                });
            }
        }
        Ok(applied)
    }
}
