//! The type registry: named descriptors, conversion operations, opaque ids.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::data::{Data, DataInner};
use crate::error::DataError;

/// Index of a type in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u16);

/// Behaviour flags of a type.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeFlags {
    /// May cross process boundaries through shared memory.
    pub shareable: bool,
    /// May be serialised onto a byte stream.
    pub streamable: bool,
    /// Carried by reference only; serialises as an opaque id.
    pub opaque: bool,
}

/// Conversion producing a new value of the target type.
pub type ConvertFn =
    dyn Fn(&TypeRegistry, &Data, TypeId) -> Result<Data, DataError> + Send + Sync;

/// Update writing into a preallocated value of the target type.
pub type UpdateFn = dyn Fn(&TypeRegistry, &Data, &Data) -> Result<(), DataError> + Send + Sync;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    ConvertTo,
    ConvertFrom,
    UpdateTo,
    UpdateFrom,
}

#[derive(Clone)]
pub(crate) enum Operation {
    Convert(Arc<ConvertFn>),
    Update(Arc<UpdateFn>),
}

#[derive(Clone)]
pub(crate) struct OpDesc {
    pub kind: OpKind,
    pub other: TypeId,
    pub op: Operation,
}

pub(crate) struct TypeDesc {
    pub name: String,
    pub predefined: bool,
    pub family: Option<TypeId>,
    pub flags: TypeFlags,
    pub ops: Vec<OpDesc>,
}

struct Tables {
    types: Vec<TypeDesc>,
    by_name: HashMap<String, TypeId>,
}

const OP_COUNT_MAX: usize = 255;

/// The registry of types and their conversion graph.
///
/// Readers dominate: lookups and conversion searches take the read lock;
/// only registration takes the write lock. Converters themselves run with
/// no lock held, so they may re-enter the registry.
pub struct TypeRegistry {
    tables: RwLock<Tables>,
    opaques: Mutex<OpaqueTable>,
}

#[derive(Default)]
struct OpaqueTable {
    next_id: u16,
    entries: HashMap<u16, Weak<DataInner>>,
}

impl TypeRegistry {
    /// A registry preloaded with the predefined types.
    pub fn new() -> Arc<TypeRegistry> {
        let reg = TypeRegistry {
            tables: RwLock::new(Tables {
                types: Vec::new(),
                by_name: HashMap::new(),
            }),
            opaques: Mutex::new(OpaqueTable {
                next_id: 1,
                entries: HashMap::new(),
            }),
        };
        crate::predefined::install(&reg);
        Arc::new(reg)
    }

    pub(crate) fn register_internal(
        &self,
        name: &str,
        flags: TypeFlags,
        family: Option<TypeId>,
        predefined: bool,
    ) -> Result<TypeId, DataError> {
        let mut tables = self.tables.write().unwrap();
        if tables.by_name.contains_key(name) {
            return Err(DataError::TypeExists);
        }
        if tables.types.len() > usize::from(u16::MAX) {
            return Err(DataError::TypeTableFull);
        }
        let id = TypeId(u16::try_from(tables.types.len()).map_err(|_| DataError::TypeTableFull)?);
        tables.types.push(TypeDesc {
            name: name.to_string(),
            predefined,
            family,
            flags,
            ops: Vec::new(),
        });
        tables.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Register a new (non-predefined) type.
    pub fn register(&self, name: &str, flags: TypeFlags) -> Result<TypeId, DataError> {
        self.register_internal(name, flags, None, false)
    }

    /// Find a type by name.
    pub fn lookup(&self, name: &str) -> Result<TypeId, DataError> {
        self.tables
            .read()
            .unwrap()
            .by_name
            .get(name)
            .copied()
            .ok_or(DataError::UnknownType)
    }

    /// Name of a type.
    pub fn name(&self, type_id: TypeId) -> Result<String, DataError> {
        self.tables
            .read()
            .unwrap()
            .types
            .get(usize::from(type_id.0))
            .map(|t| t.name.clone())
            .ok_or(DataError::UnknownType)
    }

    pub fn flags(&self, type_id: TypeId) -> Result<TypeFlags, DataError> {
        self.tables
            .read()
            .unwrap()
            .types
            .get(usize::from(type_id.0))
            .map(|t| t.flags)
            .ok_or(DataError::UnknownType)
    }

    /// Declare `family` as implicit ancestor of `type_id`.
    pub fn set_family(&self, type_id: TypeId, family: TypeId) -> Result<(), DataError> {
        let mut tables = self.tables.write().unwrap();
        let desc = tables
            .types
            .get_mut(usize::from(type_id.0))
            .ok_or(DataError::UnknownType)?;
        if desc.predefined {
            return Err(DataError::PredefinedImmutable);
        }
        desc.family = Some(family);
        Ok(())
    }

    /// Register a converter `from → to`. When `from` is predefined the
    /// operation is recorded on `to` as a reverse entry, keeping the
    /// predefined descriptor untouched; two predefined ends are refused.
    pub fn add_converter(
        &self,
        from: TypeId,
        to: TypeId,
        convert: Arc<ConvertFn>,
    ) -> Result<(), DataError> {
        let (holder, forward, other) = self.op_slot(from, to)?;
        self.push_op(
            holder,
            OpDesc {
                kind: if forward {
                    OpKind::ConvertTo
                } else {
                    OpKind::ConvertFrom
                },
                other,
                op: Operation::Convert(convert),
            },
        )
    }

    /// Register an updater `from → to` (same placement rules).
    pub fn add_updater(
        &self,
        from: TypeId,
        to: TypeId,
        update: Arc<UpdateFn>,
    ) -> Result<(), DataError> {
        let (holder, forward, other) = self.op_slot(from, to)?;
        self.push_op(
            holder,
            OpDesc {
                kind: if forward {
                    OpKind::UpdateTo
                } else {
                    OpKind::UpdateFrom
                },
                other,
                op: Operation::Update(update),
            },
        )
    }

    /// Choose where the operation lives: on `from` when mutable, else on
    /// `to` as a reverse op.
    fn op_slot(&self, from: TypeId, to: TypeId) -> Result<(TypeId, bool, TypeId), DataError> {
        let tables = self.tables.read().unwrap();
        let from_desc = tables
            .types
            .get(usize::from(from.0))
            .ok_or(DataError::UnknownType)?;
        let to_desc = tables
            .types
            .get(usize::from(to.0))
            .ok_or(DataError::UnknownType)?;
        if !from_desc.predefined {
            Ok((from, true, to))
        } else if !to_desc.predefined {
            Ok((to, false, from))
        } else {
            Err(DataError::PredefinedImmutable)
        }
    }

    fn push_op(&self, holder: TypeId, op: OpDesc) -> Result<(), DataError> {
        let mut tables = self.tables.write().unwrap();
        let desc = tables
            .types
            .get_mut(usize::from(holder.0))
            .ok_or(DataError::UnknownType)?;
        if desc.ops.len() >= OP_COUNT_MAX {
            return Err(DataError::TooManyOperations);
        }
        desc.ops.push(op);
        Ok(())
    }

    /// Install an operation on a predefined descriptor; construction only.
    pub(crate) fn push_predefined_op(&self, holder: TypeId, op: OpDesc) {
        let mut tables = self.tables.write().unwrap();
        tables.types[usize::from(holder.0)].ops.push(op);
    }

    /// Link a predefined type to its family; construction only.
    pub(crate) fn set_predefined_family(&self, type_id: TypeId, family: TypeId) {
        let mut tables = self.tables.write().unwrap();
        tables.types[usize::from(type_id.0)].family = Some(family);
    }

    fn family_chain(&self, type_id: TypeId) -> Vec<TypeId> {
        let tables = self.tables.read().unwrap();
        let mut chain = Vec::new();
        let mut cur = Some(type_id);
        while let Some(id) = cur {
            if chain.contains(&id) {
                break;
            }
            chain.push(id);
            cur = tables.types.get(usize::from(id.0)).and_then(|t| t.family);
        }
        chain
    }

    fn ops_of(&self, type_id: TypeId) -> Vec<OpDesc> {
        self.tables
            .read()
            .unwrap()
            .types
            .get(usize::from(type_id.0))
            .map(|t| t.ops.clone())
            .unwrap_or_default()
    }

    fn all_type_ids(&self) -> Vec<TypeId> {
        let n = self.tables.read().unwrap().types.len();
        (0..n).map(|i| TypeId(i as u16)).collect()
    }

    // ------------------------------------------------------------------
    // Conversion search
    // ------------------------------------------------------------------

    /// Convert `from` into a value of type `to`, allocating the result.
    pub fn convert(&self, from: &Data, to: TypeId) -> Result<Data, DataError> {
        if from.type_id() == to {
            return Ok(from.clone());
        }
        if let Some(hit) = from.cache_lookup(to) {
            return Ok(hit);
        }
        let result = self.operate_convert(from, to)?;
        from.cache_store(to, &result);
        Ok(result)
    }

    /// Update the preallocated `to_data` from `from`.
    pub fn update(&self, from: &Data, to_data: &Data) -> Result<(), DataError> {
        if from.type_id() == to_data.type_id() {
            // Same type: plain payload copy. Read fully before locking the
            // target for write, the two may share a payload through aliasing.
            let payload = {
                let guard = from.read();
                if let Some(b) = guard.bytes() {
                    crate::data::Payload::Bytes(b.into())
                } else if let Some(v) = guard.json() {
                    crate::data::Payload::Json(v.clone())
                } else {
                    return Err(DataError::InvalidValue);
                }
            };
            to_data.write()?.set(payload);
            return Ok(());
        }
        self.operate_update(from, to_data)
    }

    fn run_convert(&self, op: &Operation, input: &Data, to: TypeId) -> Option<Data> {
        match op {
            Operation::Convert(f) => f(self, input, to).ok(),
            Operation::Update(_) => None,
        }
    }

    fn run_update(&self, op: &Operation, input: &Data, to_data: &Data) -> bool {
        match op {
            Operation::Update(f) => f(self, input, to_data).is_ok(),
            Operation::Convert(_) => false,
        }
    }

    fn operate_convert(&self, from: &Data, to: TypeId) -> Result<Data, DataError> {
        // Layer 1: direct, walking the family of the origin upwards.
        let chain = self.family_chain(from.type_id());
        let to_ops = self.ops_of(to);
        for (depth, &ftype) in chain.iter().enumerate() {
            for op in &self.ops_of(ftype) {
                if op.kind == OpKind::ConvertTo && op.other == to {
                    if let Some(out) = self.run_convert(&op.op, from, to) {
                        return Ok(out);
                    }
                }
            }
            for op in &to_ops {
                if op.kind == OpKind::ConvertFrom && op.other == ftype {
                    if let Some(out) = self.run_convert(&op.op, from, to) {
                        return Ok(out);
                    }
                }
            }
            // Implicit conversion to an ancestor: alias the bytes.
            if chain.get(depth + 1) == Some(&to) {
                return Ok(from.alias(to));
            }
        }

        // Layers 2 and 3: one middle type seen from the origin (forward)
        // or from the target (backward).
        for &ftype in &chain {
            for op in &self.ops_of(ftype) {
                if op.kind != OpKind::ConvertTo {
                    continue;
                }
                let mid = op.other;
                for op2 in &to_ops {
                    if op2.kind == OpKind::ConvertFrom && op2.other == mid {
                        if let Some(out) = self.two_step(from, &op.op, mid, &op2.op, to) {
                            return Ok(out);
                        }
                    }
                }
                for op2 in &self.ops_of(mid) {
                    if op2.kind == OpKind::ConvertTo && op2.other == to {
                        if let Some(out) = self.two_step(from, &op.op, mid, &op2.op, to) {
                            return Ok(out);
                        }
                    }
                }
            }
            for op in &to_ops {
                if op.kind != OpKind::ConvertFrom {
                    continue;
                }
                let mid = op.other;
                for op2 in &self.ops_of(mid) {
                    if op2.kind == OpKind::ConvertFrom && op2.other == ftype {
                        if let Some(out) = self.two_step(from, &op2.op, mid, &op.op, to) {
                            return Ok(out);
                        }
                    }
                }
            }
        }

        // Layer 4: any registered type as middle, provided it knows how to
        // convert from the origin itself.
        for mid in self.all_type_ids() {
            if mid == to || chain.contains(&mid) {
                continue;
            }
            let mid_ops = self.ops_of(mid);
            for op in &mid_ops {
                if op.kind != OpKind::ConvertFrom || op.other != from.type_id() {
                    continue;
                }
                for op2 in &mid_ops {
                    if op2.kind == OpKind::ConvertTo && op2.other == to {
                        if let Some(out) = self.two_step(from, &op.op, mid, &op2.op, to) {
                            return Ok(out);
                        }
                    }
                }
            }
        }

        Err(DataError::NoConverter)
    }

    fn two_step(
        &self,
        from: &Data,
        first: &Operation,
        mid: TypeId,
        second: &Operation,
        to: TypeId,
    ) -> Option<Data> {
        let middle = self.run_convert(first, from, mid)?;
        self.run_convert(second, &middle, to)
    }

    fn operate_update(&self, from: &Data, to_data: &Data) -> Result<(), DataError> {
        let to = to_data.type_id();
        let chain = self.family_chain(from.type_id());
        let to_ops = self.ops_of(to);
        for &ftype in &chain {
            for op in &self.ops_of(ftype) {
                if op.kind == OpKind::UpdateTo
                    && op.other == to
                    && self.run_update(&op.op, from, to_data)
                {
                    return Ok(());
                }
            }
            for op in &to_ops {
                if op.kind == OpKind::UpdateFrom
                    && op.other == ftype
                    && self.run_update(&op.op, from, to_data)
                {
                    return Ok(());
                }
            }
        }
        // Indirect: convert to a middle, then update from it.
        for &ftype in &chain {
            for op in &self.ops_of(ftype) {
                if op.kind != OpKind::ConvertTo {
                    continue;
                }
                let mid = op.other;
                for op2 in &to_ops {
                    if op2.kind == OpKind::UpdateFrom && op2.other == mid {
                        if let Some(middle) = self.run_convert(&op.op, from, mid) {
                            if self.run_update(&op2.op, &middle, to_data) {
                                return Ok(());
                            }
                        }
                    }
                }
                for op2 in &self.ops_of(mid) {
                    if op2.kind == OpKind::UpdateTo && op2.other == to {
                        if let Some(middle) = self.run_convert(&op.op, from, mid) {
                            if self.run_update(&op2.op, &middle, to_data) {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
        Err(DataError::NoConverter)
    }

    // ------------------------------------------------------------------
    // Opaque ids
    // ------------------------------------------------------------------

    /// Give `data` a small numeric identity, stable for its lifetime.
    pub fn opacify(&self, data: &Data) -> Result<u16, DataError> {
        let mut slot = data.inner().opaque_id.lock().unwrap();
        if let Some(id) = *slot {
            return Ok(id);
        }
        let mut table = self.opaques.lock().unwrap();
        table.entries.retain(|_, weak| weak.strong_count() > 0);
        if table.entries.len() >= usize::from(u16::MAX) {
            return Err(DataError::TypeTableFull);
        }
        let mut id = table.next_id;
        while id == 0 || table.entries.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        table.next_id = id.wrapping_add(1);
        table.entries.insert(id, data.downgrade());
        *slot = Some(id);
        Ok(id)
    }

    /// Resolve an opaque id back to its live value.
    pub fn find_by_opaque_id(&self, id: u16) -> Result<Data, DataError> {
        self.opaques
            .lock()
            .unwrap()
            .entries
            .get(&id)
            .and_then(Weak::upgrade)
            .map(Data::from_inner)
            .ok_or(DataError::BadOpaque)
    }
}
