//! Remote values.
//!
//! Remote values are values that are determined after creating
//! or reading a resource from a provider.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
};

use snafu::OptionExt;

use super::{
    Action, Dependencies, DowncastSnafu, Error, HasDependencies, RemoteUnresolvedSnafu,
    Resource, StoreResource,
};

type VarFn<X> = Arc<dyn Fn(&Arc<dyn Any>) -> Result<X, Error>>;

#[derive(Clone)]
enum RemoteInner<X> {
    Unresolved {
        depends_on: String,
    },
    Var {
        depends_on: String,
        map: VarFn<X>,
        // RemoteVar<T::Output>
        var: Arc<dyn Any>,
    },
}

impl<X> RemoteInner<X> {
    fn depends_on(&self) -> &str {
        match self {
            Self::Unresolved { depends_on } => depends_on,
            Self::Var { depends_on, .. } => depends_on,
        }
    }
}

/// A value of a declared resource that is only known once that resource has
/// been applied.
#[derive(Clone)]
pub struct Remote<X> {
    inner: RemoteInner<X>,
}

impl<X: Clone + core::fmt::Debug + 'static> std::fmt::Debug for Remote<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("depends_on", &self.inner.depends_on())
            .field("value", &self.get().ok())
            .finish()
    }
}

impl<X: Clone + core::fmt::Debug + 'static> Remote<X> {
    pub(crate) fn new<T: Resource>(
        resource: &StoreResource<T, T::Output>,
        map: impl Fn(&T::Output) -> X + 'static,
    ) -> Self {
        log::trace!(
            "creating mapping of a remote resource '{}'",
            resource.remote_var.depends_on
        );
        let depends_on = resource.remote_var.depends_on.clone();
        Self {
            inner: RemoteInner::Var {
                map: Arc::new({
                    let depends_on = depends_on.clone();
                    move |any: &Arc<dyn Any>| {
                        let remote_var = any
                            .downcast_ref::<RemoteVar<T::Output>>()
                            .context(DowncastSnafu)?;
                        let t_output = remote_var.get().context(RemoteUnresolvedSnafu {
                            ty: core::any::type_name::<X>(),
                            depends_on: depends_on.clone(),
                        })?;
                        Ok(map(&t_output))
                    }
                }),
                depends_on,
                var: Arc::new(resource.remote_var.clone()),
            },
        }
    }

    /// A remote value that will never resolve.
    ///
    /// Used to build definitions that are only ever read or destroyed by name,
    /// where the creation-time configuration is irrelevant.
    pub fn unresolved(depends_on: impl Into<String>) -> Self {
        Self {
            inner: RemoteInner::Unresolved {
                depends_on: depends_on.into(),
            },
        }
    }

    pub fn get(&self) -> Result<X, Error> {
        match &self.inner {
            RemoteInner::Unresolved { depends_on } => RemoteUnresolvedSnafu {
                ty: core::any::type_name::<X>(),
                depends_on: depends_on.clone(),
            }
            .fail(),
            RemoteInner::Var {
                map,
                var,
                depends_on: _,
            } => map(var),
        }
    }

    pub fn map<Y>(&self, f: impl Fn(X) -> Y + 'static) -> Remote<Y> {
        match &self.inner {
            RemoteInner::Unresolved { depends_on } => Remote {
                inner: RemoteInner::Unresolved {
                    depends_on: depends_on.clone(),
                },
            },
            RemoteInner::Var {
                depends_on,
                map,
                var,
            } => Remote {
                inner: RemoteInner::Var {
                    depends_on: depends_on.clone(),
                    var: var.clone(),
                    map: Arc::new({
                        let map = map.clone();
                        move |any: &Arc<dyn Any>| {
                            let x = map(any)?;
                            Ok(f(x))
                        }
                    }),
                },
            },
        }
    }
}

impl<X> HasDependencies for Remote<X> {
    fn dependencies(&self) -> Dependencies {
        Dependencies {
            inner: vec![self.inner.depends_on().to_owned()],
        }
    }
}

#[derive(Debug)]
pub(crate) struct RemoteVar<T> {
    depends_on: String,
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for RemoteVar<T> {
    fn clone(&self) -> Self {
        Self {
            depends_on: self.depends_on.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> RemoteVar<T> {
    pub fn get(&self) -> Option<T> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, value: Option<T>) {
        *self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
    }
}

pub(crate) struct Var {
    pub(crate) key: usize,
    pub(crate) ty: &'static str,
    pub(crate) action: Action,
    pub(crate) remote: Box<dyn Any>,
}

#[derive(Default)]
pub(crate) struct Remotes {
    /// Map of resource name to key + RemoteVar<T>
    vars: HashMap<String, Var>,
}

impl Remotes {
    /// Returns a new `RemoteVar<T>`, its resource key and the resource's type
    /// name.
    ///
    /// ## Errors
    /// Errs if a var by the given name exists but is of a different type than the type
    /// requested.
    pub fn dequeue_var<T: Any>(
        &mut self,
        id: &str,
        action: Action,
        ty: &'static str,
    ) -> Result<(RemoteVar<T>, usize, &'static str), Error> {
        log::trace!(
            "requested remote var '{id}' of type {}",
            core::any::type_name::<T>()
        );
        let next_k = self.vars.len();
        let var = self.vars.entry(id.to_owned()).or_insert_with(|| {
            log::trace!("   but one doesn't exist, so we're creating a new entry '{next_k}'");
            Var {
                key: next_k,
                ty,
                action,
                remote: Box::new(RemoteVar::<T> {
                    depends_on: id.to_owned(),
                    inner: Default::default(),
                }),
            }
        });
        let remote: &RemoteVar<T> = var.remote.downcast_ref().context(DowncastSnafu)?;
        Ok((remote.clone(), var.key, var.ty))
    }

    /// Returns the var of the resource with the given name.
    pub fn get(&self, id: &str) -> Option<&Var> {
        self.vars.get(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unresolved_remote_reports_its_dependency() {
        let remote = Remote::<String>::unresolved("bucket");
        let deps: Vec<String> = remote.dependencies().into_iter().collect();
        assert_eq!(vec!["bucket".to_owned()], deps);

        let err = remote.map(|s| s.len()).get().unwrap_err();
        assert!(matches!(
            err,
            Error::RemoteUnresolved { depends_on, .. } if depends_on == "bucket"
        ));
    }

    #[test]
    fn dequeue_var_rejects_a_different_type() {
        let mut remotes = Remotes::default();
        let (var, key, _) = remotes
            .dequeue_var::<u32>("a", Action::Ensure, "u32")
            .unwrap();
        assert_eq!(0, key);
        var.set(Some(7));

        let (again, key, _) = remotes
            .dequeue_var::<u32>("a", Action::Ensure, "u32")
            .unwrap();
        assert_eq!(0, key);
        assert_eq!(Some(7), again.get());

        assert!(remotes
            .dequeue_var::<String>("a", Action::Ensure, "String")
            .is_err());
    }
}
