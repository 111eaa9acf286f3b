//! 概念层：类型化槽位、取值与存储

pub mod store;
pub mod value;

pub use store::{
    BatchOutcome, Binding, BindingSource, Concept, ConceptState, ConceptStore, ProposedBinding,
};
pub use value::{ConceptType, ConceptValue, Frame};
