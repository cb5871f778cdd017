//! Data acquisition plumbing: providers, fragment storage, calendar gate,
//! constituents and pacing.

pub mod calendar;
pub mod constituents;
pub mod normalize;
pub mod pacing;
pub mod provider;
pub mod store;
pub mod table;
pub mod yahoo;

pub use calendar::{ProbeCalendar, TradingCalendar};
pub use constituents::{ConstituentCache, ConstituentSnapshot, ConstituentSource, ManifestSource};
pub use pacing::{Pacer, RecordingPacer, ThreadPacer};
pub use provider::{DataError, DataProvider, ProviderRow};
pub use store::{FragmentInfo, FragmentName, FragmentStore};
pub use yahoo::YahooProvider;
