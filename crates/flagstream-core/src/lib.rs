// flagstream-core: flag/segment data model, bucketing, and user evaluation.
//
// Pure value types and pure functions only.  Nothing in this crate does I/O
// or holds locks; the relay service layers storage and transport on top.

pub mod bucket;
pub mod eval;
pub mod model;
pub mod user;

pub use bucket::bucket_user;
pub use eval::{evaluate, DataProvider, EvalResult};
pub use model::{
    AllData, Clause, DataKind, FeatureFlag, Operator, Prerequisite, Rollout, Rule, Segment,
    SegmentRule, StoreItem, Target, VariationOrRollout, WeightedVariation,
};
pub use user::User;
