//! Definition store: the live IO and service catalog of one agent.
//!
//! Wraps a [`Definition`] with the rules that make it reactive: type
//! conversion and constraint checks on every write, impulsions that never
//! hold a value, observers per IO, at most one handler per service, and the
//! frozen flag that makes inputs ignore writes.
//!
//! A store attached to an agent reports writes and structural changes to its
//! [`StoreListener`], which routes them through the worker. A standalone store
//! fires observers directly on the writing thread.

use agentbus_types::constraint::Constraint;
use agentbus_types::definition::{
    validate_name, ArgumentDefinition, DetailedType, Definition, IoDefinition, ReplyDefinition,
    ServiceDefinition,
};
use agentbus_types::error::{BusError, BusResult};
use agentbus_types::event::{IoUpdate, ServiceCall, NO_TIMESTAMP};
use agentbus_types::value::{IoKind, IoValue, ValueType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, warn};

/// Callback fired on every write to an IO.
pub type IoObserver = Arc<dyn Fn(&IoUpdate) + Send + Sync>;

/// Callback attached to a service.
pub type ServiceHandler = Arc<dyn Fn(&ServiceCall) + Send + Sync>;

/// Receives what a store cannot handle on its own.
pub trait StoreListener: Send + Sync {
    /// Timestamp to stamp on a local write.
    fn timestamp(&self) -> i64;

    /// A local write succeeded. Observers and publication are up to the listener.
    fn value_written(&self, update: IoUpdate) -> BusResult<()>;

    /// The catalog changed shape.
    fn definition_changed(&self);
}

/// The IO and service catalog of one agent.
pub struct DefinitionStore {
    definition: RwLock<Definition>,
    observers: Mutex<HashMap<(IoKind, String), Vec<IoObserver>>>,
    handlers: Mutex<HashMap<String, ServiceHandler>>,
    enforce_constraints: AtomicBool,
    frozen: AtomicBool,
    path: Mutex<Option<PathBuf>>,
    listener: Option<Weak<dyn StoreListener>>,
}

impl DefinitionStore {
    /// A standalone store whose class is `class`.
    pub fn new(class: &str) -> Self {
        Self::build(class, None)
    }

    pub(crate) fn with_listener(class: &str, listener: Weak<dyn StoreListener>) -> Self {
        Self::build(class, Some(listener))
    }

    fn build(class: &str, listener: Option<Weak<dyn StoreListener>>) -> Self {
        Self {
            definition: RwLock::new(Definition {
                class: class.to_string(),
                ..Default::default()
            }),
            observers: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            enforce_constraints: AtomicBool::new(true),
            frozen: AtomicBool::new(false),
            path: Mutex::new(None),
            listener,
        }
    }

    fn listener(&self) -> Option<Arc<dyn StoreListener>> {
        self.listener.as_ref().and_then(Weak::upgrade)
    }

    fn read<T>(&self, f: impl FnOnce(&Definition) -> T) -> T {
        let def = self.definition.read().unwrap_or_else(|e| e.into_inner());
        f(&def)
    }

    /// Apply a structural edit and announce it when it succeeds.
    fn edit<T>(&self, f: impl FnOnce(&mut Definition) -> BusResult<T>) -> BusResult<T> {
        let result = {
            let mut def = self.definition.write().unwrap_or_else(|e| e.into_inner());
            f(&mut def)
        };
        if result.is_ok() {
            if let Some(listener) = self.listener() {
                listener.definition_changed();
            }
        }
        result
    }

    /// A copy of the whole catalog.
    pub fn snapshot(&self) -> Definition {
        self.read(Definition::clone)
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn package(&self) -> String {
        self.read(|d| d.package.clone())
    }

    pub fn set_package(&self, package: &str) -> BusResult<()> {
        self.edit(|d| {
            d.package = package.to_string();
            Ok(())
        })
    }

    pub fn class(&self) -> String {
        self.read(|d| d.class.clone())
    }

    pub fn set_class(&self, class: &str) -> BusResult<()> {
        self.edit(|d| {
            d.class = class.to_string();
            Ok(())
        })
    }

    pub fn description(&self) -> String {
        self.read(|d| d.description.clone())
    }

    pub fn set_description(&self, description: &str) -> BusResult<()> {
        self.edit(|d| {
            d.description = description.to_string();
            Ok(())
        })
    }

    pub fn version(&self) -> String {
        self.read(|d| d.version.clone())
    }

    pub fn set_version(&self, version: &str) -> BusResult<()> {
        self.edit(|d| {
            d.version = version.to_string();
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // IOs
    // -----------------------------------------------------------------------

    /// Declare an IO, optionally with an initial value.
    ///
    /// The initial value is converted to `value_type`; impulsions ignore it.
    pub fn create_io(
        &self,
        kind: IoKind,
        name: &str,
        value_type: ValueType,
        initial: Option<IoValue>,
    ) -> BusResult<()> {
        validate_name(name)?;
        let mut io = IoDefinition::new(name, value_type);
        if let Some(initial) = initial {
            io.value = initial.convert(value_type).ok_or_else(|| {
                BusError::InvalidType(format!(
                    "{kind} '{name}' declared {value_type} cannot hold {}",
                    initial.value_type()
                ))
            })?;
        }
        self.edit(|d| {
            if d.io(kind, name).is_some() {
                return Err(BusError::already_exists(kind.to_string(), name));
            }
            d.ios_mut(kind).push(io);
            Ok(())
        })
    }

    pub fn remove_io(&self, kind: IoKind, name: &str) -> BusResult<()> {
        self.edit(|d| {
            let ios = d.ios_mut(kind);
            let before = ios.len();
            ios.retain(|io| io.name != name);
            if ios.len() == before {
                return Err(BusError::not_found(kind.to_string(), name));
            }
            Ok(())
        })?;
        self.lock_observers().remove(&(kind, name.to_string()));
        Ok(())
    }

    pub fn exists(&self, kind: IoKind, name: &str) -> bool {
        self.read(|d| d.io(kind, name).is_some())
    }

    /// Names of all IOs of `kind`, in declaration order.
    pub fn list(&self, kind: IoKind) -> Vec<String> {
        self.read(|d| d.ios(kind).iter().map(|io| io.name.clone()).collect())
    }

    pub fn count(&self, kind: IoKind) -> usize {
        self.read(|d| d.ios(kind).len())
    }

    pub fn io_type(&self, kind: IoKind, name: &str) -> Option<ValueType> {
        self.read(|d| d.io(kind, name).map(|io| io.value_type))
    }

    /// Current value. Impulsions always read as [`IoValue::Impulsion`].
    pub fn value(&self, kind: IoKind, name: &str) -> BusResult<IoValue> {
        self.read(|d| {
            d.io(kind, name)
                .map(|io| io.value.clone())
                .ok_or_else(|| BusError::not_found(kind.to_string(), name))
        })
    }

    /// Write an IO from the local application.
    pub fn set_value(&self, kind: IoKind, name: &str, value: impl Into<IoValue>) -> BusResult<()> {
        let listener = self.listener();
        let timestamp = listener
            .as_ref()
            .map(|l| l.timestamp())
            .unwrap_or(NO_TIMESTAMP);
        let (update, prior) = self.commit(kind, name, value.into(), timestamp)?;
        match listener {
            Some(listener) => listener.value_written(update.clone()).map_err(|e| {
                self.restore(&update, prior);
                e
            }),
            None => {
                self.notify(&update);
                Ok(())
            }
        }
    }

    /// Put back the value a write replaced, unless another write landed since.
    fn restore(&self, update: &IoUpdate, prior: IoValue) {
        let Some(written) = &update.value else {
            return;
        };
        let mut def = self.definition.write().unwrap_or_else(|e| e.into_inner());
        if let Some(io) = def.io_mut(update.kind, &update.name) {
            if &io.value == written {
                io.value = prior;
            }
        }
    }

    /// Validate and store a write without notifying anyone.
    ///
    /// Conversion or constraint failures leave the stored value untouched.
    /// Inputs of a frozen agent reject every write.
    pub(crate) fn apply(
        &self,
        kind: IoKind,
        name: &str,
        value: IoValue,
        timestamp: i64,
    ) -> BusResult<IoUpdate> {
        self.commit(kind, name, value, timestamp).map(|(update, _)| update)
    }

    /// Like [`apply`](Self::apply), also returning the value it replaced.
    fn commit(
        &self,
        kind: IoKind,
        name: &str,
        value: IoValue,
        timestamp: i64,
    ) -> BusResult<(IoUpdate, IoValue)> {
        if kind == IoKind::Input && self.is_frozen() {
            return Err(BusError::Frozen(self.class()));
        }
        let enforce = self.constraints_enforced();
        let mut def = self.definition.write().unwrap_or_else(|e| e.into_inner());
        let io = def
            .io_mut(kind, name)
            .ok_or_else(|| BusError::not_found(kind.to_string(), name))?;

        let converted = value.convert(io.value_type).ok_or_else(|| {
            BusError::InvalidType(format!(
                "{kind} '{name}' is {} and cannot take {}",
                io.value_type,
                value.value_type()
            ))
        })?;
        if enforce {
            if let Some(constraint) = &io.constraint {
                constraint
                    .check(&converted)
                    .map_err(|reason| BusError::ConstraintViolation {
                        name: name.to_string(),
                        reason,
                    })?;
            }
        }

        let prior = io.value.clone();
        let stored = if io.value_type == ValueType::Impulsion {
            None
        } else {
            io.value = converted.clone();
            Some(converted)
        };
        let update = IoUpdate {
            kind,
            name: name.to_string(),
            value_type: io.value_type,
            value: stored,
            timestamp,
        };
        Ok((update, prior))
    }

    /// Fire the observers of `update`'s IO in registration order.
    pub fn notify(&self, update: &IoUpdate) {
        let observers = self
            .lock_observers()
            .get(&(update.kind, update.name.clone()))
            .cloned()
            .unwrap_or_default();
        for observer in observers {
            observer(update);
        }
    }

    /// Reset an IO to the default value of its type, without notifying.
    pub fn clear_value(&self, kind: IoKind, name: &str) -> BusResult<()> {
        let mut def = self.definition.write().unwrap_or_else(|e| e.into_inner());
        let io = def
            .io_mut(kind, name)
            .ok_or_else(|| BusError::not_found(kind.to_string(), name))?;
        io.value = IoValue::default_for(io.value_type);
        Ok(())
    }

    /// Register an observer on an existing IO.
    pub fn observe(
        &self,
        kind: IoKind,
        name: &str,
        observer: impl Fn(&IoUpdate) + Send + Sync + 'static,
    ) -> BusResult<()> {
        if !self.exists(kind, name) {
            return Err(BusError::not_found(kind.to_string(), name));
        }
        self.lock_observers()
            .entry((kind, name.to_string()))
            .or_default()
            .push(Arc::new(observer));
        Ok(())
    }

    pub fn io_description(&self, kind: IoKind, name: &str) -> BusResult<String> {
        self.read(|d| {
            d.io(kind, name)
                .map(|io| io.description.clone())
                .ok_or_else(|| BusError::not_found(kind.to_string(), name))
        })
    }

    pub fn set_io_description(&self, kind: IoKind, name: &str, description: &str) -> BusResult<()> {
        self.edit_io(kind, name, |io| {
            io.description = description.to_string();
            Ok(())
        })
    }

    pub fn set_detailed_type(
        &self,
        kind: IoKind,
        name: &str,
        type_name: &str,
        specification: &str,
    ) -> BusResult<()> {
        self.edit_io(kind, name, |io| {
            io.detailed_type = Some(DetailedType {
                type_name: type_name.to_string(),
                specification: specification.to_string(),
            });
            Ok(())
        })
    }

    /// Attach a constraint, replacing any previous one.
    ///
    /// The current value is not re-checked; the constraint applies from the
    /// next write on.
    pub fn add_constraint(&self, kind: IoKind, name: &str, expression: &str) -> BusResult<()> {
        let constraint = Constraint::parse(expression).map_err(BusError::InvalidConstraint)?;
        self.edit_io(kind, name, |io| {
            if !constraint.applies_to(io.value_type) {
                return Err(BusError::InvalidConstraint(format!(
                    "'{constraint}' cannot apply to {} {kind} '{name}'",
                    io.value_type
                )));
            }
            io.constraint = Some(constraint);
            Ok(())
        })
    }

    pub fn constraint(&self, kind: IoKind, name: &str) -> Option<String> {
        self.read(|d| {
            d.io(kind, name)
                .and_then(|io| io.constraint.as_ref())
                .map(ToString::to_string)
        })
    }

    pub fn mute_output(&self, name: &str) -> BusResult<()> {
        self.edit_io(IoKind::Output, name, |io| {
            io.muted = true;
            Ok(())
        })
    }

    pub fn unmute_output(&self, name: &str) -> BusResult<()> {
        self.edit_io(IoKind::Output, name, |io| {
            io.muted = false;
            Ok(())
        })
    }

    pub fn is_output_muted(&self, name: &str) -> bool {
        self.read(|d| d.io(IoKind::Output, name).is_some_and(|io| io.muted))
    }

    fn edit_io(
        &self,
        kind: IoKind,
        name: &str,
        f: impl FnOnce(&mut IoDefinition) -> BusResult<()>,
    ) -> BusResult<()> {
        self.edit(|d| {
            let io = d
                .io_mut(kind, name)
                .ok_or_else(|| BusError::not_found(kind.to_string(), name))?;
            f(io)
        })
    }

    pub fn set_constraints_enforced(&self, enforce: bool) {
        self.enforce_constraints.store(enforce, Ordering::Relaxed);
    }

    pub fn constraints_enforced(&self) -> bool {
        self.enforce_constraints.load(Ordering::Relaxed)
    }

    pub(crate) fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::Relaxed);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    fn lock_observers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(IoKind, String), Vec<IoObserver>>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Services
    // -----------------------------------------------------------------------

    /// Attach a handler to a service, declaring the service if needed.
    ///
    /// A service keeps its first handler; registering another fails.
    pub fn service_init(
        &self,
        name: &str,
        handler: impl Fn(&ServiceCall) + Send + Sync + 'static,
    ) -> BusResult<()> {
        validate_name(name)?;
        {
            let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            if handlers.contains_key(name) {
                warn!(service = %name, "Service already has a callback, keeping the first one");
                return Err(BusError::CallbackAlreadyRegistered(name.to_string()));
            }
            handlers.insert(name.to_string(), Arc::new(handler));
        }
        if !self.service_exists(name) {
            self.edit(|d| {
                d.services.push(ServiceDefinition::new(name));
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn service_remove(&self, name: &str) -> BusResult<()> {
        self.edit(|d| {
            let before = d.services.len();
            d.services.retain(|s| s.name != name);
            if d.services.len() == before {
                return Err(BusError::not_found("service", name));
            }
            Ok(())
        })?;
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        Ok(())
    }

    pub fn service_exists(&self, name: &str) -> bool {
        self.read(|d| d.service(name).is_some())
    }

    pub fn service_list(&self) -> Vec<String> {
        self.read(|d| d.services.iter().map(|s| s.name.clone()).collect())
    }

    pub fn service_count(&self) -> usize {
        self.read(|d| d.services.len())
    }

    pub fn service(&self, name: &str) -> Option<ServiceDefinition> {
        self.read(|d| d.service(name).cloned())
    }

    pub fn service_handler(&self, name: &str) -> Option<ServiceHandler> {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn service_description(&self, name: &str) -> BusResult<String> {
        self.service(name)
            .map(|s| s.description)
            .ok_or_else(|| BusError::not_found("service", name))
    }

    pub fn set_service_description(&self, name: &str, description: &str) -> BusResult<()> {
        self.edit_service(name, |s| {
            s.description = description.to_string();
            Ok(())
        })
    }

    pub fn service_arg_add(&self, service: &str, arg: &str, value_type: ValueType) -> BusResult<()> {
        check_argument(arg, value_type)?;
        self.edit_service(service, |s| push_argument(&mut s.arguments, arg, value_type))
    }

    pub fn service_arg_remove(&self, service: &str, arg: &str) -> BusResult<()> {
        self.edit_service(service, |s| remove_argument(&mut s.arguments, arg))
    }

    pub fn set_service_arg_description(
        &self,
        service: &str,
        arg: &str,
        description: &str,
    ) -> BusResult<()> {
        self.edit_service(service, |s| describe_argument(&mut s.arguments, arg, description))
    }

    pub fn service_args(&self, service: &str) -> BusResult<Vec<ArgumentDefinition>> {
        self.service(service)
            .map(|s| s.arguments)
            .ok_or_else(|| BusError::not_found("service", service))
    }

    pub fn service_args_count(&self, service: &str) -> usize {
        self.service(service).map_or(0, |s| s.arguments.len())
    }

    pub fn service_arg_exists(&self, service: &str, arg: &str) -> bool {
        self.service(service)
            .is_some_and(|s| s.arguments.iter().any(|a| a.name == arg))
    }

    pub fn reply_add(&self, service: &str, reply: &str) -> BusResult<()> {
        validate_name(reply)?;
        self.edit_service(service, |s| {
            if s.reply(reply).is_some() {
                return Err(BusError::already_exists("reply", reply));
            }
            s.replies.push(ReplyDefinition {
                name: reply.to_string(),
                description: String::new(),
                arguments: Vec::new(),
            });
            Ok(())
        })
    }

    pub fn reply_remove(&self, service: &str, reply: &str) -> BusResult<()> {
        self.edit_service(service, |s| {
            let before = s.replies.len();
            s.replies.retain(|r| r.name != reply);
            if s.replies.len() == before {
                return Err(BusError::not_found("reply", reply));
            }
            Ok(())
        })
    }

    pub fn set_reply_description(&self, service: &str, reply: &str, description: &str) -> BusResult<()> {
        self.edit_reply(service, reply, |r| {
            r.description = description.to_string();
            Ok(())
        })
    }

    pub fn reply_names(&self, service: &str) -> Vec<String> {
        self.service(service)
            .map(|s| s.replies.into_iter().map(|r| r.name).collect())
            .unwrap_or_default()
    }

    pub fn reply_exists(&self, service: &str, reply: &str) -> bool {
        self.service(service).is_some_and(|s| s.reply(reply).is_some())
    }

    pub fn reply_arg_add(
        &self,
        service: &str,
        reply: &str,
        arg: &str,
        value_type: ValueType,
    ) -> BusResult<()> {
        check_argument(arg, value_type)?;
        self.edit_reply(service, reply, |r| push_argument(&mut r.arguments, arg, value_type))
    }

    pub fn reply_arg_remove(&self, service: &str, reply: &str, arg: &str) -> BusResult<()> {
        self.edit_reply(service, reply, |r| remove_argument(&mut r.arguments, arg))
    }

    pub fn set_reply_arg_description(
        &self,
        service: &str,
        reply: &str,
        arg: &str,
        description: &str,
    ) -> BusResult<()> {
        self.edit_reply(service, reply, |r| describe_argument(&mut r.arguments, arg, description))
    }

    pub fn reply_args(&self, service: &str, reply: &str) -> BusResult<Vec<ArgumentDefinition>> {
        self.service(service)
            .and_then(|s| s.reply(reply).map(|r| r.arguments.clone()))
            .ok_or_else(|| BusError::not_found("reply", reply))
    }

    pub fn reply_args_count(&self, service: &str, reply: &str) -> usize {
        self.reply_args(service, reply).map_or(0, |a| a.len())
    }

    pub fn reply_arg_exists(&self, service: &str, reply: &str, arg: &str) -> bool {
        self.reply_args(service, reply)
            .is_ok_and(|args| args.iter().any(|a| a.name == arg))
    }

    fn edit_service(
        &self,
        name: &str,
        f: impl FnOnce(&mut ServiceDefinition) -> BusResult<()>,
    ) -> BusResult<()> {
        self.edit(|d| {
            let service = d
                .service_mut(name)
                .ok_or_else(|| BusError::not_found("service", name))?;
            f(service)
        })
    }

    fn edit_reply(
        &self,
        service: &str,
        reply: &str,
        f: impl FnOnce(&mut ReplyDefinition) -> BusResult<()>,
    ) -> BusResult<()> {
        self.edit_service(service, |s| {
            let r = s
                .reply_mut(reply)
                .ok_or_else(|| BusError::not_found("reply", reply))?;
            f(r)
        })
    }

    // -----------------------------------------------------------------------
    // JSON
    // -----------------------------------------------------------------------

    /// Replace the catalog with a JSON document.
    ///
    /// Handlers of services that disappear are dropped; observers stay attached
    /// by name.
    pub fn load_json(&self, json: &str) -> BusResult<()> {
        let mut loaded = Definition::from_json(json)?;
        if loaded.class.is_empty() {
            loaded.class = self.class();
        }
        let services: Vec<String> = loaded.services.iter().map(|s| s.name.clone()).collect();
        self.edit(|d| {
            *d = loaded;
            Ok(())
        })?;
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|name, _| services.contains(name));
        debug!(class = %self.class(), "Definition loaded");
        Ok(())
    }

    /// Load a JSON document from disk and remember its path for [`save`](Self::save).
    pub fn load_file(&self, path: &Path) -> BusResult<()> {
        let json = std::fs::read_to_string(path)?;
        self.load_json(&json)?;
        self.set_path(path);
        Ok(())
    }

    pub fn to_json(&self) -> BusResult<String> {
        self.read(Definition::to_json)
    }

    pub fn set_path(&self, path: &Path) {
        *self.path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.to_path_buf());
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Write the catalog to the configured path.
    pub fn save(&self) -> BusResult<()> {
        let path = self
            .path()
            .ok_or_else(|| BusError::InvalidState("no definition path set".to_string()))?;
        std::fs::write(&path, self.to_json()?)?;
        debug!(path = %path.display(), "Definition saved");
        Ok(())
    }

    /// Drop every IO and service, keeping the class.
    pub fn clear(&self) -> BusResult<()> {
        let class = self.class();
        self.edit(|d| {
            *d = Definition {
                class,
                ..Default::default()
            };
            Ok(())
        })?;
        self.lock_observers().clear();
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}

fn check_argument(name: &str, value_type: ValueType) -> BusResult<()> {
    validate_name(name)?;
    if value_type == ValueType::Impulsion {
        return Err(BusError::InvalidType(format!(
            "argument '{name}' cannot be an impulsion"
        )));
    }
    Ok(())
}

fn push_argument(args: &mut Vec<ArgumentDefinition>, name: &str, value_type: ValueType) -> BusResult<()> {
    if args.iter().any(|a| a.name == name) {
        return Err(BusError::already_exists("argument", name));
    }
    args.push(ArgumentDefinition {
        name: name.to_string(),
        value_type,
        description: String::new(),
    });
    Ok(())
}

fn remove_argument(args: &mut Vec<ArgumentDefinition>, name: &str) -> BusResult<()> {
    let before = args.len();
    args.retain(|a| a.name != name);
    if args.len() == before {
        return Err(BusError::not_found("argument", name));
    }
    Ok(())
}

fn describe_argument(args: &mut [ArgumentDefinition], name: &str, description: &str) -> BusResult<()> {
    let arg = args
        .iter_mut()
        .find(|a| a.name == name)
        .ok_or_else(|| BusError::not_found("argument", name))?;
    arg.description = description.to_string();
    Ok(())
}
