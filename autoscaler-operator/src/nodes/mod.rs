//! NodeReconciler: the per-`Node` reconcile loop.

pub mod reconcile;
