//! Arena for building math expressions
//!
//! A [`Context`] is an arena of unique (deduplicated) math expressions,
//! represented as [`Node`] handles.  Each `Node` is specific to a particular
//! context, and is compiled into an [`Evaluator`](crate::eval::Evaluator)
//! for rendering.
mod op;

pub use op::{BinaryOpcode, Op, UnaryOpcode, Var};

use crate::Error;
use ordered_float::OrderedFloat;
use std::collections::HashMap;

/// An index in the [`Context`] operation arena
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Node(usize);

/// A `Context` holds a set of deduplicated constants, inputs, and operations.
///
/// It should be used like an arena allocator: it grows over time, then frees
/// all of its contents when dropped.
#[derive(Debug, Default)]
pub struct Context {
    ops: Vec<Op>,
    dedup: HashMap<Op, Node>,
}

impl Context {
    /// Build a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of [`Op`] nodes in the context
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Looks up the operation for the given node
    pub(crate) fn get_op(&self, node: Node) -> Option<&Op> {
        self.ops.get(node.0)
    }

    /// Checks whether the given [`Node`] is valid in this context
    fn check_node(&self, node: Node) -> Result<(), Error> {
        self.get_op(node).ok_or(Error::BadNode).map(|_| ())
    }

    fn intern(&mut self, op: Op) -> Node {
        if let Some(n) = self.dedup.get(&op) {
            *n
        } else {
            let n = Node(self.ops.len());
            self.ops.push(op);
            self.dedup.insert(op, n);
            n
        }
    }

    /// Constructs or finds an X input node
    pub fn x(&mut self) -> Node {
        self.intern(Op::Input(Var::X))
    }

    /// Constructs or finds a Y input node
    pub fn y(&mut self) -> Node {
        self.intern(Op::Input(Var::Y))
    }

    /// Constructs or finds a Z input node
    pub fn z(&mut self) -> Node {
        self.intern(Op::Input(Var::Z))
    }

    /// Constructs or finds a constant node
    pub fn constant(&mut self, f: f64) -> Node {
        self.intern(Op::Const(OrderedFloat(f)))
    }

    fn op_unary(&mut self, a: Node, op: UnaryOpcode) -> Result<Node, Error> {
        self.check_node(a)?;
        Ok(self.intern(Op::Unary(op, a)))
    }

    fn op_binary(
        &mut self,
        a: Node,
        b: Node,
        op: BinaryOpcode,
    ) -> Result<Node, Error> {
        self.check_node(a)?;
        self.check_node(b)?;
        Ok(self.intern(Op::Binary(op, a, b)))
    }

    /// Builds a node which adds two nodes
    pub fn add(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(a, b, BinaryOpcode::Add)
    }

    /// Builds a node which subtracts two nodes
    pub fn sub(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(a, b, BinaryOpcode::Sub)
    }

    /// Builds a node which multiplies two nodes
    pub fn mul(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(a, b, BinaryOpcode::Mul)
    }

    /// Builds a node which divides two nodes
    pub fn div(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(a, b, BinaryOpcode::Div)
    }

    /// Builds a node which takes the minimum of two nodes
    pub fn min(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(a, b, BinaryOpcode::Min)
    }

    /// Builds a node which takes the maximum of two nodes
    pub fn max(&mut self, a: Node, b: Node) -> Result<Node, Error> {
        self.op_binary(a, b, BinaryOpcode::Max)
    }

    /// Builds a node which negates the given node
    pub fn neg(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, UnaryOpcode::Neg)
    }

    /// Builds a node which takes the absolute value of the given node
    pub fn abs(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, UnaryOpcode::Abs)
    }

    /// Builds a node which takes the square root of the given node
    pub fn sqrt(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, UnaryOpcode::Sqrt)
    }

    /// Builds a node which squares the given node
    pub fn square(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, UnaryOpcode::Square)
    }

    /// Evaluates the given node with `f64` math
    ///
    /// This is much slower than compiling an
    /// [`Evaluator`](crate::eval::Evaluator), but can be handy for
    /// cross-checking and unit tests.
    pub fn eval_xyz(
        &self,
        node: Node,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<f64, Error> {
        self.check_node(node)?;

        // Nodes are interned after their children, so a single pass in index
        // order visits every child before its parent
        let mut vals = vec![0.0; node.0 + 1];
        for (i, op) in self.ops[..=node.0].iter().enumerate() {
            vals[i] = match *op {
                Op::Input(Var::X) => x,
                Op::Input(Var::Y) => y,
                Op::Input(Var::Z) => z,
                Op::Const(c) => c.into_inner(),
                Op::Unary(op, a) => {
                    let a = vals[a.0];
                    match op {
                        UnaryOpcode::Neg => -a,
                        UnaryOpcode::Abs => a.abs(),
                        UnaryOpcode::Sqrt => a.sqrt(),
                        UnaryOpcode::Square => a * a,
                    }
                }
                Op::Binary(op, a, b) => {
                    let (a, b) = (vals[a.0], vals[b.0]);
                    match op {
                        BinaryOpcode::Add => a + b,
                        BinaryOpcode::Sub => a - b,
                        BinaryOpcode::Mul => a * b,
                        BinaryOpcode::Div => a / b,
                        BinaryOpcode::Min => a.min(b),
                        BinaryOpcode::Max => a.max(b),
                    }
                }
            };
        }
        Ok(vals[node.0])
    }
}
