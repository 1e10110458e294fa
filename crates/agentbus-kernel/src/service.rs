//! Service RPC dispatch.
//!
//! Calls are one-way: the caller learns only whether the call was submitted.
//! Arguments are checked on both ends against the declared signature, the
//! caller when it knows the target's definition and the receiver always,
//! so a handler never sees arguments that do not fit its service.

use crate::definition::DefinitionStore;
use crate::supervisor::Supervisor;
use agentbus_types::definition::Definition;
use agentbus_types::error::{BusError, BusResult};
use agentbus_types::event::ServiceCall;
use agentbus_types::value::IoValue;
use tracing::{debug, info, warn};

/// Logging switches for the receiving side.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub warn_on_undefined: bool,
    pub log_calls: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            warn_on_undefined: true,
            log_calls: false,
        }
    }
}

/// What happened to an incoming call.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Delivered,
    UnknownService,
    NoHandler,
    /// Arguments did not match the declared signature.
    Rejected(String),
    /// The handler panicked.
    Failed,
}

/// Deliver `call` to the handler of `agent`'s service.
pub fn dispatch(
    store: &DefinitionStore,
    agent: &str,
    call: &ServiceCall,
    policy: DispatchPolicy,
    supervisor: &Supervisor,
) -> Dispatch {
    if policy.log_calls {
        info!(
            agent,
            service = %call.service,
            caller = %call.sender_name,
            args = call.arguments.len(),
            token = ?call.token,
            "Service call received"
        );
    }

    let Some(service) = store.service(&call.service) else {
        if policy.warn_on_undefined {
            warn!(agent, service = %call.service, caller = %call.sender_name, "Call to undefined service dropped");
        } else {
            debug!(agent, service = %call.service, "Call to undefined service dropped");
        }
        return Dispatch::UnknownService;
    };
    if let Err(reason) = service.validate_arguments(&call.arguments) {
        warn!(agent, service = %call.service, caller = %call.sender_name, %reason, "Service call rejected");
        return Dispatch::Rejected(reason);
    }
    let Some(handler) = store.service_handler(&call.service) else {
        warn!(agent, service = %call.service, "Service has no callback, call dropped");
        return Dispatch::NoHandler;
    };

    match supervisor.guard("service", || handler(call)) {
        Some(()) => Dispatch::Delivered,
        None => Dispatch::Failed,
    }
}

/// Check a call against the target's advertised definition before sending.
///
/// An unknown service is only logged: the target may declare it later and
/// the receiver makes the final decision.
pub fn check_call(target: &str, definition: &Definition, service: &str, arguments: &[IoValue]) -> BusResult<()> {
    match definition.service(service) {
        Some(declared) => declared
            .validate_arguments(arguments)
            .map_err(|reason| BusError::InvalidArguments {
                service: service.to_string(),
                reason,
            }),
        None => {
            warn!(target, service, "Calling a service the target does not declare");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbus_types::agent::AgentId;
    use agentbus_types::definition::ServiceDefinition;
    use agentbus_types::event::NO_TIMESTAMP;
    use agentbus_types::value::ValueType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn call(service: &str, arguments: Vec<IoValue>) -> ServiceCall {
        ServiceCall {
            sender_name: "caller".into(),
            sender_uuid: AgentId::new(),
            service: service.into(),
            arguments,
            token: Some("t-1".into()),
            timestamp: NO_TIMESTAMP,
        }
    }

    fn store_with_counter() -> (DefinitionStore, Arc<AtomicUsize>) {
        let store = DefinitionStore::new("callee");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store
            .service_init("scale", move |c| {
                assert_eq!(c.token.as_deref(), Some("t-1"));
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        store.service_arg_add("scale", "factor", ValueType::Double).unwrap();
        (store, hits)
    }

    #[test]
    fn test_dispatch_delivers_valid_call() {
        let (store, hits) = store_with_counter();
        let sup = Supervisor::new();
        let policy = DispatchPolicy::default();
        assert_eq!(
            dispatch(&store, "callee", &call("scale", vec![IoValue::Double(2.0)]), policy, &sup),
            Dispatch::Delivered
        );
        // Int is accepted for a double argument.
        assert_eq!(
            dispatch(&store, "callee", &call("scale", vec![IoValue::Int(2)]), policy, &sup),
            Dispatch::Delivered
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_service_runs_nothing() {
        let (store, hits) = store_with_counter();
        let policy = DispatchPolicy {
            warn_on_undefined: false,
            log_calls: true,
        };
        let result = dispatch(&store, "callee", &call("nope", vec![]), policy, &Supervisor::new());
        assert_eq!(result, Dispatch::UnknownService);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mismatched_arguments_rejected() {
        let (store, hits) = store_with_counter();
        let sup = Supervisor::new();
        let policy = DispatchPolicy::default();
        let wrong_type = call("scale", vec![IoValue::from("big")]);
        assert!(matches!(dispatch(&store, "callee", &wrong_type, policy, &sup), Dispatch::Rejected(_)));
        let wrong_count = call("scale", vec![]);
        assert!(matches!(dispatch(&store, "callee", &wrong_count, policy, &sup), Dispatch::Rejected(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_declared_without_handler() {
        let store = DefinitionStore::new("callee");
        store
            .load_json(r#"{"services": [{"name": "ping"}]}"#)
            .unwrap();
        let result = dispatch(&store, "callee", &call("ping", vec![]), DispatchPolicy::default(), &Supervisor::new());
        assert_eq!(result, Dispatch::NoHandler);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let store = DefinitionStore::new("callee");
        store.service_init("crash", |_| panic!("handler bug")).unwrap();
        let sup = Supervisor::new();
        let result = dispatch(&store, "callee", &call("crash", vec![]), DispatchPolicy::default(), &sup);
        assert_eq!(result, Dispatch::Failed);
        assert_eq!(sup.panic_count(), 1);
    }

    #[test]
    fn test_check_call() {
        let mut def = Definition::default();
        let mut svc = ServiceDefinition::new("scale");
        svc.arguments.push(agentbus_types::definition::ArgumentDefinition {
            name: "factor".into(),
            value_type: ValueType::Double,
            description: String::new(),
        });
        def.services.push(svc);

        check_call("B", &def, "scale", &[IoValue::Double(1.0)]).unwrap();
        assert!(matches!(
            check_call("B", &def, "scale", &[IoValue::Bool(true)]),
            Err(BusError::InvalidArguments { .. })
        ));
        check_call("B", &def, "unknown", &[IoValue::Bool(true)]).unwrap();
    }
}
