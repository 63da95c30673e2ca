//! Batched evaluation of expression trees
//!
//! An [`Evaluator`] is compiled from a [`Context`] node and owned exclusively
//! by one render worker.  It evaluates the same expression in three modes:
//!
//! - interval evaluation over an axis-aligned box, recording a [`Choice`] at
//!   every min/max node;
//! - batched pointwise evaluation of up to [`Evaluator::N`] points;
//! - batched forward-mode gradient evaluation of the same points.
//!
//! [`Evaluator::push`] opens a scope in which min/max nodes whose most recent
//! interval choice was one-sided become pass-throughs, and the subtrees they
//! no longer reference are skipped entirely; [`Evaluator::pop`] restores the
//! previous scope.  Scopes nest strictly, and must be balanced on every path.
mod choice;

pub use choice::Choice;

use crate::{
    context::{BinaryOpcode, Context, Node, Op, UnaryOpcode, Var},
    types::{Grad, Interval},
    Error,
};
use nalgebra::{Matrix4, Point3, Vector3};
use std::collections::HashMap;

/// A single operation in the flattened evaluation tape
///
/// Arguments are indices of earlier clauses.
#[derive(Copy, Clone, Debug)]
enum Clause {
    Input(Var),
    Const(f32),
    Unary(UnaryOpcode, usize),
    Binary(BinaryOpcode, usize, usize),
}

/// Batched evaluator for a single expression tree
pub struct Evaluator {
    tape: Vec<Clause>,
    mat: Matrix4<f32>,

    /// Input point slots, filled by [`set`](Self::set) /
    /// [`set_raw`](Self::set_raw)
    xs: Vec<f32>,
    ys: Vec<f32>,
    zs: Vec<f32>,

    /// Pointwise results, indexed by `clause * N + slot`
    vals: Vec<f32>,
    /// Gradient results, indexed by `clause * N + slot`
    grads: Vec<Grad>,
    /// Per-clause interval results
    intervals: Vec<Interval>,

    /// Branch choices recorded by the most recent interval evaluation
    choices: Vec<Choice>,
    /// Current specialization of each min/max clause (`Both` when undecided)
    modes: Vec<Choice>,
    /// Whether each clause is reachable under the current specialization
    active: Vec<bool>,
    /// Saved `(active, modes)` pairs for nested scopes
    stack: Vec<(Vec<bool>, Vec<Choice>)>,
}

impl Evaluator {
    /// Number of points evaluated per batched call
    pub const N: usize = 256;

    /// Flattens the subtree rooted at `node` into an evaluation tape
    pub fn new(ctx: &Context, node: Node) -> Result<Self, Error> {
        let mut tape = vec![];
        let mut map: HashMap<Node, usize> = HashMap::new();
        let mut todo = vec![(node, false)];
        while let Some((n, visited)) = todo.pop() {
            if map.contains_key(&n) {
                continue;
            }
            let op = *ctx.get_op(n).ok_or(Error::BadNode)?;
            if visited {
                let clause = match op {
                    Op::Input(v) => Clause::Input(v),
                    Op::Const(c) => Clause::Const(c.into_inner() as f32),
                    Op::Unary(op, a) => Clause::Unary(op, map[&a]),
                    Op::Binary(op, a, b) => {
                        Clause::Binary(op, map[&a], map[&b])
                    }
                };
                map.insert(n, tape.len());
                tape.push(clause);
            } else {
                todo.push((n, true));
                for c in op.iter_children() {
                    if !map.contains_key(&c) {
                        todo.push((c, false));
                    }
                }
            }
        }

        let len = tape.len();
        Ok(Self {
            tape,
            mat: Matrix4::identity(),
            xs: vec![0.0; Self::N],
            ys: vec![0.0; Self::N],
            zs: vec![0.0; Self::N],
            vals: vec![0.0; len * Self::N],
            grads: vec![Grad::default(); len * Self::N],
            intervals: vec![Interval::from(0.0); len],
            choices: vec![Choice::Unknown; len],
            modes: vec![Choice::Both; len],
            active: vec![true; len],
            stack: vec![],
        })
    }

    /// Installs the affine transform applied to every input point
    pub fn set_point_matrix(&mut self, mat: Matrix4<f32>) {
        self.mat = mat;
    }

    /// Stores an untransformed point in the given slot
    ///
    /// The point does not take effect until
    /// [`apply_transform`](Self::apply_transform) runs over its slot.
    pub fn set_raw(&mut self, p: Point3<f32>, slot: usize) {
        self.xs[slot] = p.x;
        self.ys[slot] = p.y;
        self.zs[slot] = p.z;
    }

    /// Applies the installed matrix to slots `[0, count)`
    pub fn apply_transform(&mut self, count: usize) {
        for i in 0..count {
            let p = self.mat.transform_point(&Point3::new(
                self.xs[i],
                self.ys[i],
                self.zs[i],
            ));
            self.xs[i] = p.x;
            self.ys[i] = p.y;
            self.zs[i] = p.z;
        }
    }

    /// Stores a point with the matrix applied immediately
    pub fn set(&mut self, p: Point3<f32>, slot: usize) {
        let p = self.mat.transform_point(&p);
        self.set_raw(p, slot);
    }

    /// Maps a box through the point matrix with interval arithmetic
    fn transform_box(
        &self,
        lower: Vector3<f32>,
        upper: Vector3<f32>,
    ) -> [Interval; 3] {
        let x = Interval::new(lower.x, upper.x);
        let y = Interval::new(lower.y, upper.y);
        let z = Interval::new(lower.z, upper.z);
        let mut out = [Interval::from(0.0); 3];
        for (r, o) in out.iter_mut().enumerate() {
            *o = Interval::from(self.mat[(r, 0)]) * x
                + Interval::from(self.mat[(r, 1)]) * y
                + Interval::from(self.mat[(r, 2)]) * z
                + Interval::from(self.mat[(r, 3)]);
        }
        out
    }

    /// Conservative bound of the expression over an axis-aligned box
    ///
    /// Records a [`Choice`] at every undecided min/max clause; a following
    /// [`push`](Self::push) specializes the tape accordingly.
    pub fn eval_interval(
        &mut self,
        lower: Vector3<f32>,
        upper: Vector3<f32>,
    ) -> Interval {
        let [ix, iy, iz] = self.transform_box(lower, upper);
        for idx in 0..self.tape.len() {
            if !self.active[idx] {
                continue;
            }
            self.intervals[idx] = match self.tape[idx] {
                Clause::Input(Var::X) => ix,
                Clause::Input(Var::Y) => iy,
                Clause::Input(Var::Z) => iz,
                Clause::Const(c) => Interval::from(c),
                Clause::Unary(op, a) => {
                    let a = self.intervals[a];
                    match op {
                        UnaryOpcode::Neg => -a,
                        UnaryOpcode::Abs => a.abs(),
                        UnaryOpcode::Sqrt => a.sqrt(),
                        UnaryOpcode::Square => a.square(),
                    }
                }
                Clause::Binary(op, a, b) => {
                    let (a, b) = (self.intervals[a], self.intervals[b]);
                    match op {
                        BinaryOpcode::Add => a + b,
                        BinaryOpcode::Sub => a - b,
                        BinaryOpcode::Mul => a * b,
                        BinaryOpcode::Div => a / b,
                        BinaryOpcode::Min => match self.modes[idx] {
                            Choice::Left => a,
                            Choice::Right => b,
                            _ => {
                                let (out, c) = a.min_choice(b);
                                self.choices[idx] = c;
                                out
                            }
                        },
                        BinaryOpcode::Max => match self.modes[idx] {
                            Choice::Left => a,
                            Choice::Right => b,
                            _ => {
                                let (out, c) = a.max_choice(b);
                                self.choices[idx] = c;
                                out
                            }
                        },
                    }
                }
            };
        }
        self.intervals[self.tape.len() - 1]
    }

    /// Opens a scope specialized by the most recent interval evaluation
    ///
    /// Min/max clauses whose recorded choice was one-sided become
    /// pass-throughs of the chosen side, and clauses that are no longer
    /// reachable from the root are skipped by every evaluation mode until the
    /// matching [`pop`](Self::pop).
    pub fn push(&mut self) {
        self.stack.push((self.active.clone(), self.modes.clone()));

        for idx in 0..self.tape.len() {
            if !self.active[idx] || self.modes[idx] != Choice::Both {
                continue;
            }
            if let Clause::Binary(
                BinaryOpcode::Min | BinaryOpcode::Max,
                ..,
            ) = self.tape[idx]
            {
                match self.choices[idx] {
                    Choice::Left => self.modes[idx] = Choice::Left,
                    Choice::Right => self.modes[idx] = Choice::Right,
                    _ => (),
                }
            }
        }

        // Recompute reachability under the new specialization
        self.active.fill(false);
        let mut todo = vec![self.tape.len() - 1];
        while let Some(idx) = todo.pop() {
            if self.active[idx] {
                continue;
            }
            self.active[idx] = true;
            match self.tape[idx] {
                Clause::Unary(_, a) => todo.push(a),
                Clause::Binary(
                    BinaryOpcode::Min | BinaryOpcode::Max,
                    a,
                    b,
                ) => match self.modes[idx] {
                    Choice::Left => todo.push(a),
                    Choice::Right => todo.push(b),
                    _ => {
                        todo.push(a);
                        todo.push(b);
                    }
                },
                Clause::Binary(_, a, b) => {
                    todo.push(a);
                    todo.push(b);
                }
                Clause::Input(..) | Clause::Const(..) => (),
            }
        }
    }

    /// Closes the innermost specialization scope
    ///
    /// # Panics
    /// If there is no open scope
    pub fn pop(&mut self) {
        let (active, modes) =
            self.stack.pop().expect("unbalanced evaluator pop");
        self.active = active;
        self.modes = modes;
    }

    /// Returns the number of open scopes
    pub fn push_depth(&self) -> usize {
        self.stack.len()
    }

    /// Evaluates slots `[0, count)` in bulk
    ///
    /// The result is indexed by slot, in 1:1 correspondence with the points
    /// as they were enqueued.
    pub fn values(&mut self, count: usize) -> &[f32] {
        assert!(count <= Self::N);
        let n = Self::N;
        for idx in 0..self.tape.len() {
            if !self.active[idx] {
                continue;
            }
            let (prev, cur) = self.vals.split_at_mut(idx * n);
            let out = &mut cur[..count];
            match self.tape[idx] {
                Clause::Input(v) => {
                    let src = match v {
                        Var::X => &self.xs,
                        Var::Y => &self.ys,
                        Var::Z => &self.zs,
                    };
                    out.copy_from_slice(&src[..count]);
                }
                Clause::Const(c) => out.fill(c),
                Clause::Unary(op, a) => {
                    let a = &prev[a * n..a * n + count];
                    for (o, &a) in out.iter_mut().zip(a) {
                        *o = match op {
                            UnaryOpcode::Neg => -a,
                            UnaryOpcode::Abs => a.abs(),
                            UnaryOpcode::Sqrt => a.sqrt(),
                            UnaryOpcode::Square => a * a,
                        };
                    }
                }
                Clause::Binary(op, a, b) => {
                    let mode = self.modes[idx];
                    let lhs = &prev[a * n..a * n + count];
                    let rhs = &prev[b * n..b * n + count];
                    for (i, o) in out.iter_mut().enumerate() {
                        let (a, b) = (lhs[i], rhs[i]);
                        *o = match op {
                            BinaryOpcode::Add => a + b,
                            BinaryOpcode::Sub => a - b,
                            BinaryOpcode::Mul => a * b,
                            BinaryOpcode::Div => a / b,
                            BinaryOpcode::Min => match mode {
                                Choice::Left => a,
                                Choice::Right => b,
                                _ => a.min(b),
                            },
                            BinaryOpcode::Max => match mode {
                                Choice::Left => a,
                                Choice::Right => b,
                                _ => a.max(b),
                            },
                        };
                    }
                }
            }
        }
        let root = self.tape.len() - 1;
        &self.vals[root * n..root * n + count]
    }

    /// Evaluates gradients for slots `[0, count)` in bulk
    pub fn derivs(&mut self, count: usize) -> &[Grad] {
        assert!(count <= Self::N);
        let n = Self::N;
        for idx in 0..self.tape.len() {
            if !self.active[idx] {
                continue;
            }
            let (prev, cur) = self.grads.split_at_mut(idx * n);
            let out = &mut cur[..count];
            match self.tape[idx] {
                Clause::Input(v) => {
                    for (i, o) in out.iter_mut().enumerate() {
                        *o = match v {
                            Var::X => Grad::new(self.xs[i], 1.0, 0.0, 0.0),
                            Var::Y => Grad::new(self.ys[i], 0.0, 1.0, 0.0),
                            Var::Z => Grad::new(self.zs[i], 0.0, 0.0, 1.0),
                        };
                    }
                }
                Clause::Const(c) => out.fill(Grad::from(c)),
                Clause::Unary(op, a) => {
                    let a = &prev[a * n..a * n + count];
                    for (o, &a) in out.iter_mut().zip(a) {
                        *o = match op {
                            UnaryOpcode::Neg => -a,
                            UnaryOpcode::Abs => a.abs(),
                            UnaryOpcode::Sqrt => a.sqrt(),
                            UnaryOpcode::Square => a.square(),
                        };
                    }
                }
                Clause::Binary(op, a, b) => {
                    let mode = self.modes[idx];
                    let lhs = &prev[a * n..a * n + count];
                    let rhs = &prev[b * n..b * n + count];
                    for (i, o) in out.iter_mut().enumerate() {
                        let (a, b) = (lhs[i], rhs[i]);
                        *o = match op {
                            BinaryOpcode::Add => a + b,
                            BinaryOpcode::Sub => a - b,
                            BinaryOpcode::Mul => a * b,
                            BinaryOpcode::Div => a / b,
                            BinaryOpcode::Min => match mode {
                                Choice::Left => a,
                                Choice::Right => b,
                                _ => a.min(b),
                            },
                            BinaryOpcode::Max => match mode {
                                Choice::Left => a,
                                Choice::Right => b,
                                _ => a.max(b),
                            },
                        };
                    }
                }
            }
        }
        let root = self.tape.len() - 1;
        &self.grads[root * n..root * n + count]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sphere(ctx: &mut Context, r: f64) -> Node {
        let (x, y, z) = (ctx.x(), ctx.y(), ctx.z());
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let z2 = ctx.square(z).unwrap();
        let sum = ctx.add(x2, y2).unwrap();
        let sum = ctx.add(sum, z2).unwrap();
        let r2 = ctx.constant(r * r);
        ctx.sub(sum, r2).unwrap()
    }

    #[test]
    fn test_values_match_eval_xyz() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx, 0.5);
        let mut e = Evaluator::new(&ctx, root).unwrap();

        let pts = [
            (0.0, 0.0, 0.0),
            (0.5, 0.0, 0.0),
            (0.25, -0.75, 0.125),
            (-1.0, 1.0, -1.0),
        ];
        for (slot, &(x, y, z)) in pts.iter().enumerate() {
            e.set_raw(Point3::new(x, y, z), slot);
        }
        e.apply_transform(pts.len());
        let out = e.values(pts.len());
        for (v, &(x, y, z)) in out.iter().zip(&pts) {
            let expect = ctx
                .eval_xyz(root, x as f64, y as f64, z as f64)
                .unwrap() as f32;
            assert!((v - expect).abs() < 1e-6, "got {v}, expected {expect}");
        }
    }

    #[test]
    fn test_interval() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx, 0.5);
        let mut e = Evaluator::new(&ctx, root).unwrap();

        // The whole box spans the surface
        let out = e.eval_interval(
            Vector3::new(-1.0, -1.0, -1.0),
            Vector3::new(1.0, 1.0, 1.0),
        );
        assert!(out.lower() <= 0.0 && out.upper() >= 0.0);

        // A distant corner is entirely outside
        let out = e.eval_interval(
            Vector3::new(0.75, 0.75, 0.75),
            Vector3::new(1.0, 1.0, 1.0),
        );
        assert!(out.lower() > 0.0);

        // The center is entirely inside
        let out = e.eval_interval(
            Vector3::new(-0.1, -0.1, -0.1),
            Vector3::new(0.1, 0.1, 0.1),
        );
        assert!(out.upper() < 0.0);
    }

    #[test]
    fn test_push_specializes_min() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let root = ctx.min(x, y).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();

        // x is strictly below y over this box
        let out = e.eval_interval(
            Vector3::new(-1.0, 0.5, 0.0),
            Vector3::new(-0.5, 1.0, 0.0),
        );
        assert_eq!(out.lower(), -1.0);
        assert_eq!(out.upper(), -0.5);

        e.push();
        assert_eq!(e.push_depth(), 1);

        // With the min specialized to its left side, y is ignored
        e.set_raw(Point3::new(-0.75, -100.0, 0.0), 0);
        e.apply_transform(1);
        assert_eq!(e.values(1), &[-0.75]);

        e.pop();
        assert_eq!(e.push_depth(), 0);
        e.set_raw(Point3::new(-0.75, -100.0, 0.0), 0);
        e.apply_transform(1);
        assert_eq!(e.values(1), &[-100.0]);
    }

    #[test]
    #[should_panic(expected = "unbalanced evaluator pop")]
    fn test_unbalanced_pop() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut e = Evaluator::new(&ctx, x).unwrap();
        e.pop();
    }

    #[test]
    fn test_derivs() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx, 0.5);
        let mut e = Evaluator::new(&ctx, root).unwrap();

        e.set(Point3::new(0.1, 0.2, 0.3), 0);
        let g = e.derivs(1)[0];
        assert!((g.dx - 0.2).abs() < 1e-6);
        assert!((g.dy - 0.4).abs() < 1e-6);
        assert!((g.dz - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_transform() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut e = Evaluator::new(&ctx, x).unwrap();
        e.set_point_matrix(Matrix4::new_translation(&Vector3::new(
            0.5, 0.0, 0.0,
        )));

        e.set_raw(Point3::new(1.0, 0.0, 0.0), 0);
        e.apply_transform(1);
        assert_eq!(e.values(1), &[1.5]);

        // `set` applies the matrix immediately
        e.set(Point3::new(1.0, 0.0, 0.0), 0);
        assert_eq!(e.values(1), &[1.5]);

        // ... and the interval bound shifts too
        let out = e.eval_interval(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 1.0, 1.0),
        );
        assert_eq!(out.lower(), 0.5);
        assert_eq!(out.upper(), 1.5);
    }
}
