pub mod core;
pub mod storage;
pub mod analysis;
pub mod schema;
pub mod document;
pub mod index;
pub mod scoring;
pub mod search;
pub mod query;

/*
┌──────────────────────────────────────────────────────────────────────────────┐
│                          LODESTONE ARCHITECTURE                              │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── COORDINATOR ─────────────────────────────────┐
│                                                                              │
│  struct Engine                                                               │
│  ┌────────────────────────────────────────────────────────────────────────┐  │
│  │ inner: Mutex<EngineInner>    // single-writer/single-reader surface    │  │
│  │   config: EngineConfig       // base_dir, merge size, token bounds     │  │
│  │   clock: Arc<dyn Clock>      // injectable time source (ttl, usage)    │  │
│  │   state: Lifecycle           // Uninitialized / Ready / Quarantined    │  │
│  │   stores:                                                              │  │
│  │     schema: SchemaStore      // types, SchemaTypeIds, sections         │  │
│  │     documents: DocumentStore // ground-truth log + derived maps        │  │
│  │     index: TermIndex         // lite (memory) + main (disk) tiers      │  │
│  │     cache: ResultCache       // page tokens -> unfetched result tails  │  │
│  └────────────────────────────────────────────────────────────────────────┘  │
│                                                                              │
│  Put:    validate -> log append -> tokenize -> lite hits (-> merge)          │
│  Search: parse -> per-term iterators -> AND -> liveness join -> score        │
│          -> first page + token for the tail                                  │
│  Init:   open stores -> verify checksums -> rebuild derived state            │
│          -> replay index drift -> stamp combined header                      │
└──────────────────────────────────────────────────────────────────────────────┘

┌────────────── STORAGE ──────────────┐  ┌──────────────── INDEX ─────────────┐
│ RecordLog    // crc-framed appends  │  │ LiteIndex  // hit buffer + lexicon │
│ EngineHeader // magic + combined crc│  │ MainIndex  // fst + posting lists  │
│ write_checksummed / read_checksummed│  │ HitIterator// union/restrict enum  │
└─────────────────────────────────────┘  └────────────────────────────────────┘
*/

pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::config::EngineConfig;
pub use crate::core::engine::Engine;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::stats::{
    DataStatus, InitializeStats, OptimizeInfo, OptimizeResult, PutStats, RecoveryCause,
    SetSchemaResult,
};
pub use crate::core::types::{
    Document, DocumentId, PropertyValue, SchemaTypeId, SectionId, UsageReport, UsageType,
};
pub use crate::schema::schema::{
    Cardinality, DataKind, PropertyConfig, Schema, SchemaType, StringIndexing, TermMatch,
    TokenizerKind,
};
pub use crate::scoring::scorer::{Order, RankingStrategy, ScoringSpec};
pub use crate::search::results::{ResultSpec, SearchResultEntry, SearchResults, SearchSpec};
pub use crate::search::snippet::{SnippetEntry, SnippetSpec};
