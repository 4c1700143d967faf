mod predicate;
mod table;

pub use predicate::Predicate;
pub use table::{BuildContext, CompiledRoute, RouteTable};
