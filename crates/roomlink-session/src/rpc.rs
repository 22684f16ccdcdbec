//! Remote procedure calls addressed by a sorted method table.
//!
//! Each component type declares its invokable methods once as
//! `(name, handler)` pairs. The table is sorted by name (byte-wise), and a
//! method's wire address is its position in the sorted table, so every
//! build that declares the same names agrees on the indices.
//!
//! ```text
//! RPC body: [u8 method index][i32 len][data]
//! ```
//!
//! ```
//! use std::sync::OnceLock;
//! use roomlink_session::{ComponentContext, RpcHandler, RpcTable, RpcTarget};
//!
//! struct Door { open: bool }
//!
//! impl Door {
//!     fn open(&mut self, _ctx: &mut ComponentContext<'_>, _data: &[u8]) { self.open = true; }
//!     fn close(&mut self, _ctx: &mut ComponentContext<'_>, _data: &[u8]) { self.open = false; }
//! }
//!
//! impl RpcTarget for Door {
//!     fn rpc_table() -> &'static RpcTable<Self> {
//!         static TABLE: OnceLock<RpcTable<Door>> = OnceLock::new();
//!         TABLE.get_or_init(|| {
//!             RpcTable::new([
//!                 ("Open", Door::open as RpcHandler<Door>),
//!                 ("Close", Door::close as RpcHandler<Door>),
//!             ])
//!         })
//!     }
//! }
//!
//! assert_eq!(Door::rpc_table().index_of("Close"), Some(0));
//! ```

use roomlink_net::{Reader, Writer};

use crate::component::ComponentContext;
use crate::error::RpcError;

/// Most methods a single component type may expose.
pub const MAX_RPC_METHODS: usize = 255;

/// Handler signature for one RPC method.
pub type RpcHandler<C> = fn(&mut C, &mut ComponentContext<'_>, &[u8]);

/// Sorted `(name, handler)` table for one component type.
pub struct RpcTable<C> {
    entries: Vec<(&'static str, RpcHandler<C>)>,
}

impl<C> RpcTable<C> {
    /// Build a table, rejecting duplicates and oversize tables.
    pub fn try_new(
        methods: impl IntoIterator<Item = (&'static str, RpcHandler<C>)>,
    ) -> Result<Self, RpcError> {
        let mut entries: Vec<_> = methods.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        if let Some(pair) = entries.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(RpcError::DuplicateMethod(pair[0].0));
        }
        if entries.len() > MAX_RPC_METHODS {
            return Err(RpcError::TooManyMethods(entries.len()));
        }
        Ok(Self { entries })
    }

    /// Build a table, logging and dropping entries that would make it
    /// invalid: later duplicates of a name, and methods past the size limit.
    pub fn new(methods: impl IntoIterator<Item = (&'static str, RpcHandler<C>)>) -> Self {
        let mut entries: Vec<_> = methods.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let before = entries.len();
        entries.dedup_by(|later, earlier| later.0 == earlier.0);
        if entries.len() != before {
            tracing::error!(
                "RPC table dropped {} duplicate method name(s)",
                before - entries.len()
            );
        }
        if entries.len() > MAX_RPC_METHODS {
            tracing::error!(
                "RPC table has {} methods, keeping the first {MAX_RPC_METHODS}",
                entries.len()
            );
            entries.truncate(MAX_RPC_METHODS);
        }
        Self { entries }
    }

    /// Index of `name`, if registered.
    pub fn index_of(&self, name: &str) -> Option<u8> {
        self.entries
            .binary_search_by(|(n, _)| (*n).cmp(name))
            .ok()
            .and_then(|i| u8::try_from(i).ok())
    }

    /// Name at `index`, if in range.
    pub fn name_at(&self, index: u8) -> Option<&'static str> {
        self.entries.get(index as usize).map(|(n, _)| *n)
    }

    /// Method names in index order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(n, _)| *n)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Call the method at `index` on `target`.
    pub fn invoke(
        &self,
        target: &mut C,
        index: u8,
        ctx: &mut ComponentContext<'_>,
        data: &[u8],
    ) -> Result<(), RpcError> {
        let (_, handler) = self
            .entries
            .get(index as usize)
            .ok_or(RpcError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            })?;
        handler(target, ctx, data);
        Ok(())
    }
}

/// A component type with a static RPC table.
pub trait RpcTarget: Sized + 'static {
    /// The type's method table, built once.
    fn rpc_table() -> &'static RpcTable<Self>;
}

/// Object-safe view of an RPC-capable component.
pub trait RpcDispatch {
    /// Index of `method` in this component's table.
    fn rpc_index(&self, method: &str) -> Option<u8>;

    /// Name at `index` in this component's table.
    fn rpc_name(&self, index: u8) -> Option<&'static str>;

    /// Invoke the method at `index`.
    fn invoke_rpc(
        &mut self,
        index: u8,
        ctx: &mut ComponentContext<'_>,
        data: &[u8],
    ) -> Result<(), RpcError>;
}

impl<T: RpcTarget> RpcDispatch for T {
    fn rpc_index(&self, method: &str) -> Option<u8> {
        T::rpc_table().index_of(method)
    }

    fn rpc_name(&self, index: u8) -> Option<&'static str> {
        T::rpc_table().name_at(index)
    }

    fn invoke_rpc(
        &mut self,
        index: u8,
        ctx: &mut ComponentContext<'_>,
        data: &[u8],
    ) -> Result<(), RpcError> {
        T::rpc_table().invoke(self, index, ctx, data)
    }
}

/// Write an RPC body.
pub fn encode_rpc_body(w: &mut Writer, index: u8, data: &[u8]) {
    w.write_u8(index);
    w.write_i32(data.len() as i32);
    w.write_bytes(data);
}

/// Split an RPC body into method index and argument bytes.
pub fn decode_rpc_body(body: &[u8]) -> Result<(u8, &[u8]), RpcError> {
    let mut r = Reader::new(body);
    let index = r.read_u8()?;
    let len = r.read_len()?;
    Ok((index, r.read_bytes(len)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::time::Instant;

    #[derive(Default)]
    struct Probe {
        calls: Vec<(&'static str, Vec<u8>)>,
    }

    impl Probe {
        fn zap(&mut self, _ctx: &mut ComponentContext<'_>, data: &[u8]) {
            self.calls.push(("Zap", data.to_vec()));
        }
        fn foo(&mut self, _ctx: &mut ComponentContext<'_>, data: &[u8]) {
            self.calls.push(("Foo", data.to_vec()));
        }
        fn bar(&mut self, _ctx: &mut ComponentContext<'_>, data: &[u8]) {
            self.calls.push(("Bar", data.to_vec()));
        }
    }

    impl RpcTarget for Probe {
        fn rpc_table() -> &'static RpcTable<Self> {
            static TABLE: OnceLock<RpcTable<Probe>> = OnceLock::new();
            TABLE.get_or_init(|| {
                RpcTable::new([
                    ("Zap", Probe::zap as RpcHandler<Probe>),
                    ("Foo", Probe::foo as RpcHandler<Probe>),
                    ("Bar", Probe::bar as RpcHandler<Probe>),
                ])
            })
        }
    }

    fn with_ctx<R>(f: impl FnOnce(&mut ComponentContext<'_>) -> R) -> R {
        let mut outbox = Vec::new();
        let mut ctx = ComponentContext {
            network_id: "1-0",
            slot: 0,
            owner: Some(1),
            local_user: Some(1),
            now: Instant::now(),
            outbox: &mut outbox,
        };
        f(&mut ctx)
    }

    #[test]
    fn test_table_is_sorted_by_name() {
        let names: Vec<_> = Probe::rpc_table().names().collect();
        assert_eq!(names, vec!["Bar", "Foo", "Zap"]);
        assert_eq!(Probe::rpc_table().index_of("Foo"), Some(1));
        assert_eq!(Probe::rpc_table().index_of("Nope"), None);
    }

    #[test]
    fn test_index_one_invokes_foo() {
        let mut probe = Probe::default();
        with_ctx(|ctx| probe.invoke_rpc(1, ctx, &[7])).unwrap();
        assert_eq!(probe.calls, vec![("Foo", vec![7])]);
    }

    #[test]
    fn test_out_of_range_index_is_error() {
        let mut probe = Probe::default();
        let err = with_ctx(|ctx| probe.invoke_rpc(3, ctx, &[])).unwrap_err();
        assert_eq!(err, RpcError::IndexOutOfRange { index: 3, len: 3 });
        assert!(probe.calls.is_empty());
    }

    #[test]
    fn test_sorting_is_bytewise() {
        fn noop(_: &mut Probe, _: &mut ComponentContext<'_>, _: &[u8]) {}
        let table = RpcTable::<Probe>::try_new([("b", noop as RpcHandler<Probe>), ("B", noop), ("a", noop)])
            .unwrap();
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["B", "a", "b"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        fn noop(_: &mut Probe, _: &mut ComponentContext<'_>, _: &[u8]) {}
        let err = RpcTable::<Probe>::try_new([("X", noop as RpcHandler<Probe>), ("X", noop)])
            .err()
            .unwrap();
        assert_eq!(err, RpcError::DuplicateMethod("X"));
        assert_eq!(RpcTable::<Probe>::new([("X", noop as RpcHandler<Probe>), ("X", noop)]).len(), 1);
    }

    #[test]
    fn test_table_size_limit() {
        fn noop(_: &mut Probe, _: &mut ComponentContext<'_>, _: &[u8]) {}
        let names: Vec<&'static str> = (0..300)
            .map(|i| &*Box::leak(format!("m{i:03}").into_boxed_str()))
            .collect();
        let methods = || names.iter().map(|n| (*n, noop as RpcHandler<Probe>));
        assert_eq!(
            RpcTable::try_new(methods()).err(),
            Some(RpcError::TooManyMethods(300))
        );
        assert_eq!(RpcTable::new(methods()).len(), MAX_RPC_METHODS);
    }

    #[test]
    fn test_body_layout() {
        let mut w = Writer::new();
        encode_rpc_body(&mut w, 1, &[0xAA, 0xBB]);
        assert_eq!(w.as_slice(), &[1, 2, 0, 0, 0, 0xAA, 0xBB]);
        let (index, data) = decode_rpc_body(w.as_slice()).unwrap();
        assert_eq!(index, 1);
        assert_eq!(data, &[0xAA, 0xBB]);
        assert!(decode_rpc_body(&[1, 9, 0, 0, 0]).is_err());
    }
}
