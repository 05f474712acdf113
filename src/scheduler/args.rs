//! Type-erased job arguments.
//!
//! Operations are registered under a name and receive their arguments as
//! [`Split`] plus [`ThreadArgs`]; the scheduler only needs to know whether an
//! argument is an input, a mergeable accumulator or a plain value.

use std::any::{Any, type_name};
use std::fmt;

use serde::Serialize;

use crate::distributed::WireArg;
use crate::error::{Error, Result};
use crate::{MergeContext, Mergeable, Splits, Splittable};

/// One unit of input work, consumed exactly once
pub struct Split(Box<dyn Any + Send>);

impl Split {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Split(Box::new(value))
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Unwrap the split as a `T`
    pub fn take<T: Any>(self) -> Result<T> {
        self.0
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| Error::SplitType(type_name::<T>()))
    }
}

impl fmt::Debug for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Split")
    }
}

/// Object-safe view of a [`Splittable`]
pub trait AnySplittable: Send + Sync {
    fn splits_any(&self) -> Result<Splits<'_>>;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

impl<T: Splittable + 'static> AnySplittable for T {
    fn splits_any(&self) -> Result<Splits<'_>> {
        self.splits()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Object-safe view of a [`Mergeable`]
pub trait AnyMergeable: Send + Sync {
    fn replicate_any(&self) -> Box<dyn AnyMergeable>;
    fn merge_any(&mut self, partials: Option<Vec<Box<dyn AnyMergeable>>>, ctx: &MergeContext<'_>) -> Result<()>;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn as_any_mut(&mut self) -> &mut (dyn Any + Send + Sync);
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
    fn type_name(&self) -> &'static str;
}

impl<T: Mergeable + 'static> AnyMergeable for T {
    fn replicate_any(&self) -> Box<dyn AnyMergeable> {
        Box::new(self.replicate())
    }

    fn merge_any(&mut self, partials: Option<Vec<Box<dyn AnyMergeable>>>, ctx: &MergeContext<'_>) -> Result<()> {
        let partials = match partials {
            Some(partials) => {
                let mut typed = Vec::with_capacity(partials.len());
                for partial in partials {
                    let partial = partial
                        .into_any()
                        .downcast::<T>()
                        .map_err(|_| Error::InvalidArgument(format!("partial is not a {}", type_name::<T>())))?;
                    typed.push(*partial);
                }
                Some(typed)
            }
            None => None,
        };
        self.merge(partials, ctx)
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + Send + Sync) {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

enum ArgValue {
    Input(Box<dyn AnySplittable>),
    Mergeable(Box<dyn AnyMergeable>),
    Value(Box<dyn Any + Send + Sync>),
}

/// An argument handed to [`Scheduler::run`](crate::Scheduler::run).
///
/// The first argument of every job is an input. An argument that should also
/// reach remote workers carries a [`WireArg`] describing how to rebuild it
/// there.
pub struct Arg {
    value: ArgValue,
    wire: Option<WireArg>,
}

impl Arg {
    pub fn input<T: Splittable + 'static>(input: T) -> Self {
        Self {
            value: ArgValue::Input(Box::new(input)),
            wire: None,
        }
    }

    pub fn mergeable<T: Mergeable + 'static>(target: T) -> Self {
        Self {
            value: ArgValue::Mergeable(Box::new(target)),
            wire: None,
        }
    }

    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: ArgValue::Value(Box::new(value)),
            wire: None,
        }
    }

    /// Input shipped to workers in serialized form
    pub fn shipped_input<T: Splittable + Serialize + 'static>(type_name: &str, input: T) -> Result<Self> {
        let wire = WireArg::serialized(type_name, &input)?;
        Ok(Self::input(input).with_wire(wire))
    }

    /// Plain value shipped to workers in serialized form
    pub fn shipped_value<T: Any + Send + Sync + Serialize>(type_name: &str, value: T) -> Result<Self> {
        let wire = WireArg::serialized(type_name, &value)?;
        Ok(Self::value(value).with_wire(wire))
    }

    /// Mergeable that workers construct afresh from their registry
    pub fn constructed_mergeable<T: Mergeable + 'static>(type_name: &str, target: T) -> Self {
        Self::mergeable(target).with_wire(WireArg::constructed(type_name))
    }

    pub fn with_wire(mut self, wire: WireArg) -> Self {
        self.wire = Some(wire);
        self
    }

    pub fn wire(&self) -> Option<&WireArg> {
        self.wire.as_ref()
    }

    pub fn kind(&self) -> &'static str {
        match &self.value {
            ArgValue::Input(_) => "input",
            ArgValue::Mergeable(_) => "mergeable",
            ArgValue::Value(_) => "value",
        }
    }

    pub fn is_mergeable(&self) -> bool {
        matches!(self.value, ArgValue::Mergeable(_))
    }

    fn any_ref(&self) -> &(dyn Any + Send + Sync) {
        match &self.value {
            ArgValue::Input(v) => v.as_any(),
            ArgValue::Mergeable(v) => v.as_any(),
            ArgValue::Value(v) => &**v,
        }
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.any_ref().downcast_ref::<T>()
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        match &mut self.value {
            ArgValue::Input(_) => None,
            ArgValue::Mergeable(v) => v.as_any_mut().downcast_mut::<T>(),
            ArgValue::Value(v) => v.downcast_mut::<T>(),
        }
    }

    /// Take the argument back after a run
    pub fn into_inner<T: Any>(self) -> Result<T> {
        let boxed: Box<dyn Any + Send + Sync> = match self.value {
            ArgValue::Input(_) => return Err(Error::InvalidArgument("inputs cannot be taken back".into())),
            ArgValue::Mergeable(v) => v.into_any(),
            ArgValue::Value(v) => v,
        };
        boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| Error::InvalidArgument(format!("argument is not a {}", type_name::<T>())))
    }

    pub(crate) fn as_splittable(&self) -> Option<&dyn AnySplittable> {
        match &self.value {
            ArgValue::Input(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn as_mergeable(&self) -> Option<&dyn AnyMergeable> {
        match &self.value {
            ArgValue::Mergeable(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn as_mergeable_mut(&mut self) -> Option<&mut (dyn AnyMergeable + 'static)> {
        match &mut self.value {
            ArgValue::Mergeable(v) => Some(v.as_mut()),
            _ => None,
        }
    }

    pub(crate) fn shared_ref(&self) -> &(dyn Any + Send + Sync) {
        self.any_ref()
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arg")
            .field("kind", &self.kind())
            .field("wire", &self.wire.as_ref().map(|w| w.type_name.as_str()))
            .finish()
    }
}

pub(crate) enum Slot<'a> {
    Input,
    Shared(&'a (dyn Any + Send + Sync)),
    Owned(Box<dyn AnyMergeable>),
}

/// Arguments of one operation invocation, indexed like the job's parameters.
///
/// Index 0 is the input and is delivered as the split instead.
pub struct ThreadArgs<'a> {
    slots: Vec<Slot<'a>>,
}

impl<'a> ThreadArgs<'a> {
    pub(crate) fn new(slots: Vec<Slot<'a>>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get<T: Any>(&self, index: usize) -> Result<&T> {
        let any: &(dyn Any + Send + Sync) = match self.slots.get(index) {
            Some(Slot::Shared(v)) => *v,
            Some(Slot::Owned(v)) => v.as_any(),
            _ => return Err(argument_type::<T>(index)),
        };
        any.downcast_ref::<T>().ok_or_else(|| argument_type::<T>(index))
    }

    /// Mutable access; only per-thread replicas are mutable
    pub fn get_mut<T: Any>(&mut self, index: usize) -> Result<&mut T> {
        match self.slots.get_mut(index) {
            Some(Slot::Owned(v)) => v
                .as_any_mut()
                .downcast_mut::<T>()
                .ok_or_else(|| argument_type::<T>(index)),
            Some(Slot::Shared(_)) => Err(Error::InvalidArgument(format!(
                "argument {} is shared and cannot be modified",
                index
            ))),
            _ => Err(argument_type::<T>(index)),
        }
    }

    /// Per-thread replicas, by parameter index
    pub(crate) fn into_replicas(self) -> Vec<Option<Box<dyn AnyMergeable>>> {
        self.slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Owned(v) => Some(v),
                Slot::Input | Slot::Shared(_) => None,
            })
            .collect()
    }
}

fn argument_type<T>(index: usize) -> Error {
    Error::ArgumentType {
        index,
        expected: type_name::<T>(),
    }
}
