//! Named operations and the argument types workers can rebuild.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::Config;
use crate::distributed::{ArgKind, WireArg};
use crate::error::{Error, Result};
use crate::scheduler::args::{Arg, Split, ThreadArgs};
use crate::{Mergeable, Splittable};

pub type JobFn = dyn Fn(Split, &mut ThreadArgs<'_>) -> Result<()> + Send + Sync;

type Decoder = Arc<dyn Fn(&[u8]) -> Result<Arg> + Send + Sync>;
type Constructor = Arc<dyn Fn(&Arc<Config>) -> Arg + Send + Sync>;

/// An operation together with its parameter layout.
///
/// `shared[i]` tells whether parameter `i` is handed to every thread as is
/// (shared) or replicated per thread and merged afterwards. Parameter 0 is the
/// input and is never shared.
#[derive(Clone)]
pub struct JobBinding {
    name: String,
    shared: Vec<bool>,
    func: Arc<JobFn>,
}

impl JobBinding {
    pub fn new<F>(name: impl Into<String>, shared: &[bool], func: F) -> Result<Self>
    where
        F: Fn(Split, &mut ThreadArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        match shared.first() {
            None => return Err(Error::NoArguments),
            Some(true) => return Err(Error::SharedFirstParameter),
            Some(false) => {}
        }
        Ok(Self {
            name: name.into(),
            shared: shared.to_vec(),
            func: Arc::new(func),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.shared.len()
    }

    pub fn is_shared(&self, index: usize) -> bool {
        self.shared.get(index).copied().unwrap_or(false)
    }

    pub fn invoke(&self, split: Split, args: &mut ThreadArgs<'_>) -> Result<()> {
        (self.func)(split, args)
    }
}

impl fmt::Debug for JobBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobBinding")
            .field("name", &self.name)
            .field("shared", &self.shared)
            .finish()
    }
}

/// Lookup table from operation names to bindings, and from wire type names to
/// argument factories.
///
/// Master and workers build the same registry at startup; a work request then
/// refers to operations and argument types by name only.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobBinding>,
    decoders: HashMap<String, Decoder>,
    constructors: HashMap<String, Constructor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, binding: JobBinding) -> &mut Self {
        debug!("registered job {} with {} parameters", binding.name, binding.arity());
        self.jobs.insert(binding.name.clone(), binding);
        self
    }

    /// Validate and register `func` under `name`
    pub fn register_job<F>(&mut self, name: &str, shared: &[bool], func: F) -> Result<&mut Self>
    where
        F: Fn(Split, &mut ThreadArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let binding = JobBinding::new(name, shared, func)?;
        Ok(self.register(binding))
    }

    pub fn job(&self, name: &str) -> Result<&JobBinding> {
        self.jobs
            .get(name)
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))
    }

    /// Binding for `name`, checked against the number of arguments given
    pub fn resolve(&self, name: &str, given: usize) -> Result<&JobBinding> {
        let binding = self.job(name)?;
        if binding.arity() != given {
            return Err(Error::Arity {
                name: name.to_string(),
                expected: binding.arity(),
                given,
            });
        }
        Ok(binding)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Inputs of type `T` may arrive in serialized form under `type_name`
    pub fn register_input<T>(&mut self, type_name: &str) -> &mut Self
    where
        T: Splittable + DeserializeOwned + 'static,
    {
        self.decoders.insert(
            type_name.to_string(),
            Arc::new(|bytes: &[u8]| -> Result<Arg> { Ok(Arg::input(bincode::deserialize::<T>(bytes)?)) }),
        );
        self
    }

    /// Plain values of type `T` may arrive in serialized form under `type_name`
    pub fn register_value<T>(&mut self, type_name: &str) -> &mut Self
    where
        T: Any + Send + Sync + DeserializeOwned,
    {
        self.decoders.insert(
            type_name.to_string(),
            Arc::new(|bytes: &[u8]| -> Result<Arg> { Ok(Arg::value(bincode::deserialize::<T>(bytes)?)) }),
        );
        self
    }

    /// Mergeables named `type_name` are built on the receiving side by `factory`
    pub fn register_mergeable<T, F>(&mut self, type_name: &str, factory: F) -> &mut Self
    where
        T: Mergeable + 'static,
        F: Fn(&Arc<Config>) -> T + Send + Sync + 'static,
    {
        self.constructors.insert(
            type_name.to_string(),
            Arc::new(move |config: &Arc<Config>| -> Arg { Arg::mergeable(factory(config)) }),
        );
        self
    }

    /// Rebuild an argument received from the master
    pub fn decode_arg(&self, wire: &WireArg, config: &Arc<Config>) -> Result<Arg> {
        let arg = match &wire.kind {
            ArgKind::Serialized(bytes) => {
                let decode = self
                    .decoders
                    .get(&wire.type_name)
                    .ok_or_else(|| unknown_type(&wire.type_name))?;
                decode(bytes)?
            }
            ArgKind::Constructed => {
                let construct = self
                    .constructors
                    .get(&wire.type_name)
                    .ok_or_else(|| unknown_type(&wire.type_name))?;
                construct(config)
            }
        };
        Ok(arg.with_wire(wire.clone()))
    }
}

fn unknown_type(type_name: &str) -> Error {
    Error::InvalidArgument(format!("no argument factory registered for {}", type_name))
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut jobs: Vec<_> = self.jobs.keys().collect();
        jobs.sort();
        f.debug_struct("JobRegistry").field("jobs", &jobs).finish()
    }
}
