//! Incremental view over the merged listing collection.
//!
//! Stages, applied in fixed order:
//! - [`LiveCollection`]: mirror of the merged output, in arrival order
//! - [`FilterEngine`]: visibility flags, quick filter and caller predicate
//! - [`SortEngine`]: multi-key comparator over a frozen [`SortKeyTable`]
//! - [`Paginator`]: page negotiation against the filtered size
//!
//! Every stage coalesces its rebuild requests with a [`Debouncer`].
//! [`ListingView`] wires the stages together and only recomputes the
//! stages whose inputs changed.

pub mod collection;
pub mod debounce;
pub mod error;
pub mod filter;
pub mod paginator;
pub mod sort;
pub mod view;

pub use collection::{LiveCollection, ViewRow};
pub use debounce::Debouncer;
pub use error::{ViewError, ViewResult};
pub use filter::{ActivePredicate, FilterEngine, FilterSpec, ItemPredicate, QuickFilterMatcher};
pub use paginator::{compute_page, Paginator};
pub use sort::{ItemComparator, SortEngine, SortKeyTable};
pub use view::{FlushOutcome, ListingView, ViewSettings};
