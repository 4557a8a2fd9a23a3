use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::marker::PhantomData;

use log::debug;

use crate::error::EngineError;
use crate::expression::{ExpressionNode, Value};

/// One subscript of a variable path: a nonnegative integer or a string key.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum VarKey {
    Index(usize),
    Name(String),
}

impl From<usize> for VarKey {
    fn from(index: usize) -> Self {
        VarKey::Index(index)
    }
}

impl From<i32> for VarKey {
    fn from(index: i32) -> Self {
        if index < 0 {
            panic!("negative variable subscript {index}");
        }
        VarKey::Index(index as usize)
    }
}

impl From<&str> for VarKey {
    fn from(name: &str) -> Self {
        VarKey::Name(name.to_string())
    }
}

impl From<String> for VarKey {
    fn from(name: String) -> Self {
        VarKey::Name(name)
    }
}

/// A node of the variables tree. The variant is fixed by the first use.
#[derive(Clone, Debug)]
pub(crate) enum VarNode {
    Unset,
    /// A value leaf, payload is the insertion-order index `q`.
    Leaf(usize),
    /// A dense vector of a fixed length, children addressed by integer only.
    Vector(Vec<VarNode>),
    /// Sparse integer keys, enumerated in ascending order.
    IntMap(BTreeMap<usize, VarNode>),
    /// Sparse string keys, enumerated lexicographically.
    StrMap(BTreeMap<String, VarNode>),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Leaf {
    pub(crate) x0: f64,
    pub(crate) is_constant: bool,
    pub(crate) frozen_index: Option<usize>,
}

/// The per-thread session: the variables tree plus the expression store.
#[derive(Default)]
pub(crate) struct Session {
    pub(crate) root: VarNode,
    pub(crate) leaves: Vec<Leaf>,
    pub(crate) nodes: Vec<ExpressionNode>,
    pub(crate) frozen: bool,
}

impl Default for VarNode {
    fn default() -> Self {
        VarNode::Unset
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<Session>> = const { RefCell::new(None) };
}

pub(crate) fn with_active<R>(
    f: impl FnOnce(&Session) -> Result<R, EngineError>,
) -> Result<R, EngineError> {
    ACTIVE.with(|slot| match &*slot.borrow() {
        Some(session) => f(session),
        None => Err(EngineError::NoSession),
    })
}

pub(crate) fn with_active_mut<R>(
    f: impl FnOnce(&mut Session) -> Result<R, EngineError>,
) -> Result<R, EngineError> {
    ACTIVE.with(|slot| match &mut *slot.borrow_mut() {
        Some(session) => f(session),
        None => Err(EngineError::NoSession),
    })
}

/// The guard of the thread's expression session. At most one session is
/// active per thread; creating a second fails. Dropping the guard destroys
/// the session, invalidating every proxy and handle minted from it.
pub struct VarsContext {
    _thread_bound: PhantomData<*const ()>,
}

impl VarsContext {
    pub fn new() -> Result<Self, EngineError> {
        ACTIVE.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(EngineError::Management(
                    "an expression session is already active on this thread".to_string(),
                ));
            }
            *slot = Some(Session::default());
            Ok(VarsContext {
                _thread_bound: PhantomData,
            })
        })
    }

    /// Stamps dense indices and locks the namespace against mutation.
    pub fn freeze(&self) -> Result<VarsConfig, EngineError> {
        freeze_active()
    }

    /// Permits mutation again. Leaves added afterwards reshuffle the dense
    /// indices on the next stamping.
    pub fn unfreeze(&self) -> Result<(), EngineError> {
        with_active_mut(|session| {
            if !session.frozen {
                return Err(EngineError::NotFrozen);
            }
            session.frozen = false;
            Ok(())
        })
    }

    /// Stamps dense indices without locking the namespace. Useful when
    /// derivatives are to be taken while the problem is still being built.
    pub fn reindex_vars(&self) -> Result<VarsConfig, EngineError> {
        with_active_mut(|session| Ok(stamp(session)))
    }

    pub fn number_of_vars(&self) -> Result<usize, EngineError> {
        with_active(|session| Ok(session.leaves.len()))
    }

    pub fn number_of_nodes(&self) -> Result<usize, EngineError> {
        with_active(|session| Ok(session.nodes.len()))
    }
}

impl Drop for VarsContext {
    fn drop(&mut self) {
        ACTIVE.with(|slot| slot.borrow_mut().take());
    }
}

pub(crate) fn freeze_active() -> Result<VarsConfig, EngineError> {
    with_active_mut(|session| {
        if session.frozen {
            return Err(EngineError::AlreadyFrozen);
        }
        let config = stamp(session);
        session.frozen = true;
        debug!(
            "froze {} vars over {} expression nodes",
            config.number_of_vars(),
            config.number_of_nodes
        );
        Ok(config)
    })
}

pub(crate) fn unfreeze_active_if_frozen() {
    let _ = with_active_mut(|session| {
        session.frozen = false;
        Ok(())
    });
}

/// The dense snapshot produced by stamping: one `{name, x0, is_constant}`
/// entry per live leaf, ordered lexicographically over paths (integer keys
/// numerically, string keys bytewise).
#[derive(Clone, Debug)]
pub struct VarsConfig {
    pub name: Vec<String>,
    pub x0: Vec<f64>,
    pub is_constant: Vec<bool>,
    /// Leaf insertion index `q` per dense index.
    pub(crate) q_by_dense: Vec<usize>,
    /// Dense index per leaf insertion index `q`.
    pub(crate) dense_by_q: Vec<usize>,
    /// A frozen copy of the tree, for path addressing without the session.
    pub(crate) tree: VarNode,
    /// The expression-store size when the snapshot was taken.
    pub(crate) number_of_nodes: usize,
}

impl VarsConfig {
    pub fn number_of_vars(&self) -> usize {
        self.x0.len()
    }
}

fn stamp(session: &mut Session) -> VarsConfig {
    fn collect(node: &VarNode, path: &mut String, order: &mut Vec<(usize, String)>) {
        match node {
            VarNode::Unset => {}
            VarNode::Leaf(q) => order.push((*q, path.clone())),
            VarNode::Vector(children) => {
                for (index, child) in children.iter().enumerate() {
                    let rollback = path.len();
                    let _ = write!(path, "[{index}]");
                    collect(child, path, order);
                    path.truncate(rollback);
                }
            }
            VarNode::IntMap(map) => {
                for (index, child) in map {
                    let rollback = path.len();
                    let _ = write!(path, "[{index}]");
                    collect(child, path, order);
                    path.truncate(rollback);
                }
            }
            VarNode::StrMap(map) => {
                for (key, child) in map {
                    let rollback = path.len();
                    let _ = write!(path, "['{key}']");
                    collect(child, path, order);
                    path.truncate(rollback);
                }
            }
        }
    }

    let mut order = Vec::with_capacity(session.leaves.len());
    collect(&session.root, &mut String::from("x"), &mut order);

    let mut dense_by_q = vec![0usize; session.leaves.len()];
    let mut config = VarsConfig {
        name: Vec::with_capacity(order.len()),
        x0: Vec::with_capacity(order.len()),
        is_constant: Vec::with_capacity(order.len()),
        q_by_dense: Vec::with_capacity(order.len()),
        dense_by_q: Vec::new(),
        tree: VarNode::Unset,
        number_of_nodes: session.nodes.len(),
    };
    for (i, (q, path)) in order.iter().enumerate() {
        session.leaves[*q].frozen_index = Some(i);
        dense_by_q[*q] = i;
        let leaf = session.leaves[*q];
        config.name.push(format!("{path}{{{i}}}"));
        config.x0.push(leaf.x0);
        config.is_constant.push(leaf.is_constant);
        config.q_by_dense.push(*q);
    }
    config.dense_by_q = dense_by_q;
    config.tree = session.root.clone();
    config
}

const MAX_DENSE_VECTOR_LENGTH: usize = 1_000_000;

/// The root proxy of the variables namespace; subscripting is done with
/// [`Var::at`]. Proxies are cheap path accumulators: validation happens when
/// an operation is applied, against the thread's active session.
pub fn x() -> Var {
    Var { path: Vec::new() }
}

/// A path into the variables namespace.
#[derive(Clone, Debug)]
pub struct Var {
    path: Vec<VarKey>,
}

// Walks the tree along `path`, materializing missing interior nodes. The
// frozen flag turns every would-be mutation into a `Frozen` error.
fn resolve_create<'a>(
    mut node: &'a mut VarNode,
    path: &[VarKey],
    frozen: bool,
    display: &str,
) -> Result<&'a mut VarNode, EngineError> {
    for key in path {
        if matches!(node, VarNode::Unset) {
            if frozen {
                return Err(EngineError::Frozen);
            }
            *node = match key {
                VarKey::Index(_) => VarNode::IntMap(BTreeMap::new()),
                VarKey::Name(_) => VarNode::StrMap(BTreeMap::new()),
            };
        }
        node = match (key, node) {
            (VarKey::Index(index), VarNode::Vector(children)) => {
                if *index >= children.len() {
                    return Err(if frozen {
                        EngineError::Frozen
                    } else {
                        EngineError::Management(format!(
                            "index {index} is out of bounds for the dense vector of length {} at '{display}'",
                            children.len()
                        ))
                    });
                }
                &mut children[*index]
            }
            (VarKey::Index(index), VarNode::IntMap(map)) => {
                if frozen && !map.contains_key(index) {
                    return Err(EngineError::Frozen);
                }
                map.entry(*index).or_insert(VarNode::Unset)
            }
            (VarKey::Name(name), VarNode::StrMap(map)) => {
                if frozen && !map.contains_key(name) {
                    return Err(EngineError::Frozen);
                }
                map.entry(name.clone()).or_insert(VarNode::Unset)
            }
            _ => return Err(EngineError::TypeMismatch(display.to_string())),
        };
    }
    Ok(node)
}

// Read-only walk: `Ok(None)` when the path addresses nothing yet,
// `TypeMismatch` when it conflicts with an existing variant.
fn resolve_read<'a>(
    mut node: &'a VarNode,
    path: &[VarKey],
    display: &str,
) -> Result<Option<&'a VarNode>, EngineError> {
    for key in path {
        node = match (key, node) {
            (VarKey::Index(index), VarNode::Vector(children)) => match children.get(*index) {
                Some(child) => child,
                None => return Ok(None),
            },
            (VarKey::Index(index), VarNode::IntMap(map)) => match map.get(index) {
                Some(child) => child,
                None => return Ok(None),
            },
            (VarKey::Name(name), VarNode::StrMap(map)) => match map.get(name) {
                Some(child) => child,
                None => return Ok(None),
            },
            (_, VarNode::Unset) => return Ok(None),
            _ => return Err(EngineError::TypeMismatch(display.to_string())),
        };
    }
    Ok(Some(node))
}

impl Var {
    /// Extends the path by one subscript.
    pub fn at(&self, key: impl Into<VarKey>) -> Var {
        let mut path = self.path.clone();
        path.push(key.into());
        Var { path }
    }

    fn display_name(&self) -> String {
        let mut name = String::from("x");
        for key in &self.path {
            match key {
                VarKey::Index(index) => {
                    let _ = write!(name, "[{index}]");
                }
                VarKey::Name(string) => {
                    let _ = write!(name, "['{string}']");
                }
            }
        }
        name
    }

    /// Assigns the starting value of the leaf at this path, creating interior
    /// nodes along the way. Assigning the value a leaf already holds is a
    /// no-op; a different value fails with `Reassignment`.
    pub fn set(&self, value: f64) -> Result<(), EngineError> {
        let display = self.display_name();
        with_active_mut(|session| {
            let frozen = session.frozen;
            let Session { root, leaves, .. } = session;
            let node = resolve_create(root, &self.path, frozen, &display)?;
            match node {
                VarNode::Unset => {
                    if frozen {
                        return Err(EngineError::Frozen);
                    }
                    let q = leaves.len();
                    leaves.push(Leaf {
                        x0: value,
                        is_constant: false,
                        frozen_index: None,
                    });
                    *node = VarNode::Leaf(q);
                    Ok(())
                }
                VarNode::Leaf(q) => {
                    if leaves[*q].x0 == value {
                        Ok(())
                    } else if frozen {
                        Err(EngineError::Frozen)
                    } else {
                        Err(EngineError::Reassignment(display.clone()))
                    }
                }
                _ => Err(EngineError::TypeMismatch(display.clone())),
            }
        })
    }

    /// Marks an existing leaf constant. Idempotent.
    pub fn set_constant(&self) -> Result<(), EngineError> {
        let display = self.display_name();
        with_active_mut(|session| {
            let q = match resolve_read(&session.root, &self.path, &display)? {
                Some(VarNode::Leaf(q)) => *q,
                Some(_) | None => return Err(EngineError::IsNotLeaf(display.clone())),
            };
            if session.frozen && !session.leaves[q].is_constant {
                return Err(EngineError::Frozen);
            }
            session.leaves[q].is_constant = true;
            Ok(())
        })
    }

    /// Creates or verifies the leaf value, then marks it constant.
    pub fn set_constant_to(&self, value: f64) -> Result<(), EngineError> {
        self.set(value)?;
        self.set_constant()
    }

    /// Declares a dense vector of length `len` at this path. Redeclaring with
    /// the same length is a no-op; a different length is a type mismatch.
    pub fn dense_double_vector(&self, len: usize) -> Result<(), EngineError> {
        let display = self.display_name();
        if len == 0 || len > MAX_DENSE_VECTOR_LENGTH {
            return Err(EngineError::Management(format!(
                "dense vector length {len} at '{display}' is out of [1, {MAX_DENSE_VECTOR_LENGTH}]"
            )));
        }
        with_active_mut(|session| {
            let frozen = session.frozen;
            let node = resolve_create(&mut session.root, &self.path, frozen, &display)?;
            match node {
                VarNode::Unset => {
                    if frozen {
                        return Err(EngineError::Frozen);
                    }
                    *node = VarNode::Vector(vec![VarNode::Unset; len]);
                    Ok(())
                }
                VarNode::Vector(children) => {
                    if children.len() == len {
                        Ok(())
                    } else {
                        Err(EngineError::TypeMismatch(display.clone()))
                    }
                }
                _ => Err(EngineError::TypeMismatch(display.clone())),
            }
        })
    }

    /// The expression handle of the leaf at this path.
    pub fn val(&self) -> Result<Value, EngineError> {
        let display = self.display_name();
        with_active(|session| match resolve_read(&session.root, &self.path, &display)? {
            Some(VarNode::Leaf(q)) => Ok(Value::from_var(*q)),
            Some(_) | None => Err(EngineError::IsNotLeaf(display.clone())),
        })
    }

    /// The insertion-order leaf index `q`.
    pub fn leaf_index(&self) -> Result<usize, EngineError> {
        let display = self.display_name();
        with_active(|session| match resolve_read(&session.root, &self.path, &display)? {
            Some(VarNode::Leaf(q)) => Ok(*q),
            Some(_) | None => Err(EngineError::IsNotLeaf(display.clone())),
        })
    }

    /// The dense index stamped by the latest freeze or reindex.
    pub fn dense_index(&self) -> Result<usize, EngineError> {
        let display = self.display_name();
        with_active(|session| match resolve_read(&session.root, &self.path, &display)? {
            Some(VarNode::Leaf(q)) => session.leaves[*q].frozen_index.ok_or_else(|| {
                EngineError::Management(format!("variable '{display}' has no dense index yet"))
            }),
            Some(_) | None => Err(EngineError::IsNotLeaf(display.clone())),
        })
    }

    /// The fully qualified display name, with the dense index appended in
    /// braces once the leaf has been stamped.
    pub fn full_name(&self) -> Result<String, EngineError> {
        let display = self.display_name();
        with_active(|session| {
            let mut name = display.clone();
            if let Some(VarNode::Leaf(q)) = resolve_read(&session.root, &self.path, &display)? {
                if let Some(i) = session.leaves[*q].frozen_index {
                    let _ = write!(name, "{{{i}}}");
                }
            }
            Ok(name)
        })
    }

    /// A stable, human-readable dump of the subtree at this path, for
    /// debugging and external serialization. Informational only.
    pub fn internal_debug_dump(&self) -> Result<String, EngineError> {
        let display = self.display_name();
        with_active(|session| {
            let node = resolve_read(&session.root, &self.path, &display)?
                .ok_or_else(|| EngineError::IsNotLeaf(display.clone()))?;
            let mut out = String::new();
            dump_node(node, &session.leaves, &mut out);
            Ok(out)
        })
    }
}

fn dump_node(node: &VarNode, leaves: &[Leaf], out: &mut String) {
    match node {
        VarNode::Unset => out.push_str("{'U':{}}"),
        VarNode::Leaf(q) => {
            let leaf = &leaves[*q];
            let _ = write!(out, "{{'X':{{'q':{q}");
            if let Some(i) = leaf.frozen_index {
                let _ = write!(out, ",'i':{i}");
            }
            let _ = write!(out, ",'x':{:?}", leaf.x0);
            if leaf.is_constant {
                out.push_str(",'c':true");
            }
            out.push_str("}}");
        }
        VarNode::Vector(children) => {
            out.push_str("{'V':{'z':[");
            for (index, child) in children.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                dump_node(child, leaves, out);
            }
            out.push_str("]}}");
        }
        VarNode::IntMap(map) => {
            out.push_str("{'I':{'z':[");
            for (position, (index, child)) in map.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                let _ = write!(out, "[{index},");
                dump_node(child, leaves, out);
                out.push(']');
            }
            out.push_str("]}}");
        }
        VarNode::StrMap(map) => {
            out.push_str("{'S':{'z':{");
            for (position, (key, child)) in map.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                let _ = write!(out, "'{key}':");
                dump_node(child, leaves, out);
            }
            out.push_str("}}}");
        }
    }
}

/// The holder of a concrete point: starts at the configuration's `x0` and is
/// mutated as the optimization moves. Mappers address values through the same
/// path subscripts as the namespace and are fully independent of the session.
#[derive(Clone, Debug)]
pub struct VarsMapper {
    pub(crate) config: VarsConfig,
    /// The point, indexed densely; pass as the input of compiled functions.
    pub x: Vec<f64>,
}

impl VarsMapper {
    pub fn new(config: &VarsConfig) -> Self {
        VarsMapper {
            config: config.clone(),
            x: config.x0.clone(),
        }
    }

    pub fn config(&self) -> &VarsConfig {
        &self.config
    }

    /// Starts a path into the mapped variables.
    pub fn at(&mut self, key: impl Into<VarKey>) -> MapperSlot<'_> {
        MapperSlot {
            mapper: self,
            path: vec![key.into()],
        }
    }
}

/// A path into a [`VarsMapper`], built by chained subscripts.
pub struct MapperSlot<'a> {
    mapper: &'a mut VarsMapper,
    path: Vec<VarKey>,
}

impl MapperSlot<'_> {
    pub fn at(mut self, key: impl Into<VarKey>) -> Self {
        self.path.push(key.into());
        self
    }

    fn display_name(&self) -> String {
        let mut name = String::from("x");
        for key in &self.path {
            match key {
                VarKey::Index(index) => {
                    let _ = write!(name, "[{index}]");
                }
                VarKey::Name(string) => {
                    let _ = write!(name, "['{string}']");
                }
            }
        }
        name
    }

    fn dense_index(&self) -> Result<usize, EngineError> {
        let display = self.display_name();
        let config = &self.mapper.config;
        match resolve_read(&config.tree, &self.path, &display) {
            Ok(Some(VarNode::Leaf(q))) => Ok(config.dense_by_q[*q]),
            Ok(Some(_)) => Err(EngineError::IsNotLeaf(display)),
            // A mapper addresses a sealed set of variables; everything that
            // does not resolve to one of them is a wrong path.
            Ok(None) | Err(EngineError::TypeMismatch(_)) => Err(EngineError::WrongVar(display)),
            Err(other) => Err(other),
        }
    }

    pub fn get(&self) -> Result<f64, EngineError> {
        let i = self.dense_index()?;
        Ok(self.mapper.x[i])
    }

    /// Sets the value behind this path; constants refuse with `VarIsConstant`.
    pub fn set(&mut self, value: f64) -> Result<(), EngineError> {
        let i = self.dense_index()?;
        if self.mapper.config.is_constant[i] {
            return Err(EngineError::VarIsConstant(self.display_name()));
        }
        self.mapper.x[i] = value;
        Ok(())
    }

    /// Sets the value even when the variable is marked constant.
    pub fn set_constant_value(&mut self, value: f64) -> Result<(), EngineError> {
        let i = self.dense_index()?;
        self.mapper.x[i] = value;
        Ok(())
    }
}
