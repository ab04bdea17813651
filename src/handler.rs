//! Event handler registry and argument binding.
//!
//! Handlers are registered per `(namespace, event)` key and called from the
//! ingress loop with the raw elements of the wire argument array. Typed
//! registration replaces runtime signature checks: a callback is accepted as
//! long as every parameter implements [`DeserializeOwned`], and a callback
//! returning a [`Serialize`] value (registered through `on_with_ack`) is used
//! to answer incoming ack requests.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;

use crate::errors::{DispatchError, Error};

/// A registry key: the namespace and event a handler listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct HandlerKey {
    pub nsp: String,
    pub event: String,
}

impl HandlerKey {
    pub fn new(nsp: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            nsp: nsp.into(),
            event: event.into(),
        }
    }
}

/// A registered callback.
pub(crate) enum Handler {
    Event(Box<dyn ErasedHandler>),
    /// Carrier of the synthetic `error` event: the callback receives the
    /// error value directly instead of deserialized wire arguments.
    Error(Box<dyn Fn(Error) + Send + Sync>),
}

/// A type-erased event handler, callable with the raw wire arguments.
pub(crate) trait ErasedHandler: Send + Sync {
    fn call(&self, event: &str, args: &[&RawValue]) -> Result<Option<Value>, DispatchError>;
    fn arity(&self) -> usize;
    fn produces_reply(&self) -> bool;
}

/// A callback listening on an event, with 0 to 8 deserializable parameters.
pub trait MessageHandler<T>: Send + Sync + 'static {
    /// Bind the raw wire arguments and invoke the callback.
    fn call(&self, event: &str, args: &[&RawValue]) -> Result<(), DispatchError>;

    /// Number of parameters the callback declares.
    fn arity(&self) -> usize;

    #[doc(hidden)]
    fn phantom(&self) -> PhantomData<T> {
        PhantomData
    }
}

/// A callback listening on an event that produces a reply value, used to
/// answer incoming ack requests.
pub trait ReplyHandler<T>: Send + Sync + 'static {
    /// Bind the raw wire arguments, invoke the callback and serialize its
    /// reply.
    fn call(&self, event: &str, args: &[&RawValue]) -> Result<Value, DispatchError>;

    /// Number of parameters the callback declares.
    fn arity(&self) -> usize;

    #[doc(hidden)]
    fn phantom(&self) -> PhantomData<T> {
        PhantomData
    }
}

/// Erases a [`MessageHandler`] so it can be stored in the registry map.
pub(crate) struct MakeErasedHandler<H, T> {
    handler: H,
    type_: PhantomData<fn(T)>,
}

impl<H, T> MakeErasedHandler<H, T> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            type_: PhantomData,
        }
    }
}

impl<H, T> ErasedHandler for MakeErasedHandler<H, T>
where
    H: MessageHandler<T>,
    T: 'static,
{
    fn call(&self, event: &str, args: &[&RawValue]) -> Result<Option<Value>, DispatchError> {
        self.handler.call(event, args).map(|()| None)
    }

    fn arity(&self) -> usize {
        self.handler.arity()
    }

    fn produces_reply(&self) -> bool {
        false
    }
}

/// Erases a [`ReplyHandler`] so it can be stored in the registry map.
pub(crate) struct MakeErasedReplyHandler<H, T> {
    handler: H,
    type_: PhantomData<fn(T)>,
}

impl<H, T> MakeErasedReplyHandler<H, T> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            type_: PhantomData,
        }
    }
}

impl<H, T> ErasedHandler for MakeErasedReplyHandler<H, T>
where
    H: ReplyHandler<T>,
    T: 'static,
{
    fn call(&self, event: &str, args: &[&RawValue]) -> Result<Option<Value>, DispatchError> {
        self.handler.call(event, args).map(Some)
    }

    fn arity(&self) -> usize {
        self.handler.arity()
    }

    fn produces_reply(&self) -> bool {
        true
    }
}

/// The variadic-of-any handler: receives every wire argument as a
/// [`Value`], however many there are.
pub(crate) struct VariadicHandler<F>(pub F);

impl<F> ErasedHandler for VariadicHandler<F>
where
    F: Fn(Vec<Value>) + Send + Sync + 'static,
{
    fn call(&self, event: &str, args: &[&RawValue]) -> Result<Option<Value>, DispatchError> {
        check_arity(event, args.len(), 1)?;

        let values = args
            .iter()
            .map(|raw| serde_json::from_str(raw.get()))
            .collect::<Result<Vec<Value>, _>>()
            .map_err(DispatchError::Json)?;

        (self.0)(values);
        Ok(None)
    }

    fn arity(&self) -> usize {
        1
    }

    fn produces_reply(&self) -> bool {
        false
    }
}

/// Split a wire payload (a JSON array) into its raw elements.
pub(crate) fn split_args(data: &str) -> Result<Vec<&RawValue>, DispatchError> {
    serde_json::from_str(data).map_err(DispatchError::Json)
}

fn check_arity(event: &str, parts: usize, arity: usize) -> Result<(), DispatchError> {
    if arity > parts {
        return Err(DispatchError::InvalidInterface {
            event: event.to_owned(),
            reason: format!("message has {parts} arguments, but listener requires at least {arity}"),
        });
    }

    Ok(())
}

fn decode_arg<T: DeserializeOwned>(raw: &RawValue) -> Result<T, DispatchError> {
    serde_json::from_str(raw.get()).map_err(DispatchError::Json)
}

macro_rules! count {
    () => { 0 };
    ($head:ident $(, $tail:ident)*) => { 1 + count!($($tail),*) };
}

macro_rules! impl_message_handler {
    ([$($ty:ident),*]) => {
        #[allow(non_snake_case, unused)]
        impl<F, $($ty,)*> MessageHandler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) + Send + Sync + 'static,
            $( $ty: DeserializeOwned + Send + Sync + 'static, )*
        {
            fn call(&self, event: &str, args: &[&RawValue]) -> Result<(), DispatchError> {
                check_arity(event, args.len(), count!($($ty),*))?;

                // Surplus wire arguments beyond the declared parameters are
                // dropped.
                let mut parts = args.iter();
                $( let $ty: $ty = decode_arg(parts.next().expect("arity checked"))?; )*

                (self)($($ty,)*);
                Ok(())
            }

            fn arity(&self) -> usize {
                count!($($ty),*)
            }
        }
    };
}

macro_rules! impl_reply_handler {
    ([$($ty:ident),*]) => {
        #[allow(non_snake_case, unused)]
        impl<F, R, $($ty,)*> ReplyHandler<(R, $($ty,)*)> for F
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: Serialize + Send + Sync + 'static,
            $( $ty: DeserializeOwned + Send + Sync + 'static, )*
        {
            fn call(&self, event: &str, args: &[&RawValue]) -> Result<Value, DispatchError> {
                check_arity(event, args.len(), count!($($ty),*))?;

                let mut parts = args.iter();
                $( let $ty: $ty = decode_arg(parts.next().expect("arity checked"))?; )*

                serde_json::to_value((self)($($ty,)*)).map_err(DispatchError::Json)
            }

            fn arity(&self) -> usize {
                count!($($ty),*)
            }
        }
    };
}

macro_rules! all_the_tuples {
    ($name:ident) => {
        $name!([]);
        $name!([T1]);
        $name!([T1, T2]);
        $name!([T1, T2, T3]);
        $name!([T1, T2, T3, T4]);
        $name!([T1, T2, T3, T4, T5]);
        $name!([T1, T2, T3, T4, T5, T6]);
        $name!([T1, T2, T3, T4, T5, T6, T7]);
        $name!([T1, T2, T3, T4, T5, T6, T7, T8]);
    };
}

all_the_tuples!(impl_message_handler);
all_the_tuples!(impl_reply_handler);

/// The handler map: many concurrent lookups, rare writes. Handlers are
/// cloned out of the lock before being invoked.
#[derive(Default)]
pub(crate) struct Handlers {
    map: RwLock<HashMap<HandlerKey, Arc<Handler>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, silently replacing any previous one at the key.
    pub fn set(&self, key: HandlerKey, handler: Arc<Handler>) {
        self.map.write().unwrap().insert(key, handler);
    }

    pub fn get(&self, nsp: &str, event: &str) -> Option<Arc<Handler>> {
        let key = HandlerKey::new(nsp, event);
        self.map.read().unwrap().get(&key).cloned()
    }

    pub fn remove(&self, nsp: &str, event: &str) {
        let key = HandlerKey::new(nsp, event);
        self.map.write().unwrap().remove(&key);
    }

    /// Events with a handler registered on `nsp`.
    pub fn list(&self, nsp: &str) -> Vec<String> {
        self.map
            .read()
            .unwrap()
            .keys()
            .filter(|key| key.nsp == nsp)
            .map(|key| key.event.clone())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    fn raw(data: &str) -> Vec<&RawValue> {
        split_args(data).unwrap()
    }

    fn erase<T: 'static, H: MessageHandler<T>>(handler: H) -> Box<dyn ErasedHandler> {
        Box::new(MakeErasedHandler::new(handler))
    }

    #[test]
    fn binds_positional_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let handler = erase(move |line: String, code: i64| {
            captured.lock().unwrap().push((line, code));
        });

        assert_eq!(handler.arity(), 2);
        let data = r#"["$ ls", 0]"#;
        handler.call("stdout", &raw(data)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("$ ls".to_owned(), 0)]);
    }

    #[test]
    fn drops_surplus_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let handler = erase(move |line: String| {
            captured.lock().unwrap().push(line);
        });

        let data = r#"["first", "second", "third"]"#;
        handler.call("stdout", &raw(data)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["first".to_owned()]);
    }

    #[test]
    fn rejects_missing_arguments() {
        let handler = erase(|_a: String, _b: String| {});

        let data = r#"["only one"]"#;
        let err = handler.call("stdout", &raw(data)).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidInterface { ref event, .. } if event == "stdout"));
    }

    #[test]
    fn reports_undecodable_argument() {
        let handler = erase(|_n: i64| {});

        let data = r#"["not a number"]"#;
        let err = handler.call("count", &raw(data)).unwrap_err();
        assert!(matches!(err, DispatchError::Json(_)));
    }

    #[test]
    fn zero_arity_handler_ignores_payload() {
        let seen = Arc::new(Mutex::new(0));
        let captured = seen.clone();
        let handler = erase(move || {
            *captured.lock().unwrap() += 1;
        });

        assert_eq!(handler.arity(), 0);
        handler.call("connection", &[]).unwrap();
        handler.call("connection", &raw(r#"["ignored"]"#)).unwrap();

        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn reply_handler_serializes_its_result() {
        let handler: Box<dyn ErasedHandler> =
            Box::new(MakeErasedReplyHandler::new(|a: i64, b: i64| a + b));

        assert!(handler.produces_reply());
        let reply = handler.call("add", &raw("[2,3]")).unwrap();
        assert_eq!(reply, Some(Value::from(5)));
    }

    #[test]
    fn variadic_handler_collects_all_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let handler = VariadicHandler(move |values: Vec<Value>| {
            captured.lock().unwrap().extend(values);
        });

        handler.call("tail", &raw(r#"["a", 1, null]"#)).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Value::from("a"), Value::from(1), Value::Null]
        );
    }

    #[test]
    fn variadic_handler_requires_one_argument() {
        let handler = VariadicHandler(|_: Vec<Value>| {});
        let err = handler.call("tail", &[]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidInterface { .. }));
    }

    #[test]
    fn registry_replaces_and_removes() {
        let handlers = Handlers::new();
        let key = HandlerKey::new("", "stdout");

        handlers.set(key.clone(), Arc::new(Handler::Event(erase(|| {}))));
        handlers.set(key.clone(), Arc::new(Handler::Event(erase(|| {}))));
        assert_eq!(handlers.list(""), vec!["stdout".to_owned()]);

        handlers.remove("", "stdout");
        assert!(handlers.list("").is_empty());
        assert!(handlers.get("", "stdout").is_none());
    }

    #[test]
    fn registry_lists_by_namespace() {
        let handlers = Handlers::new();
        handlers.set(
            HandlerKey::new("/shell", "stdout"),
            Arc::new(Handler::Event(erase(|| {}))),
        );
        handlers.set(
            HandlerKey::new("", "stdout"),
            Arc::new(Handler::Event(erase(|| {}))),
        );

        assert_eq!(handlers.list("/shell"), vec!["stdout".to_owned()]);
        assert_eq!(handlers.list(""), vec!["stdout".to_owned()]);
        assert!(handlers.list("/other").is_empty());
    }
}
