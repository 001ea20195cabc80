//! Domain identifiers (strongly-typed IDs).
//!
//! 2 種類の ID を使い分けます。
//!
//! - **`Id<T>`**: ULID ベース。planner が払い出す Job / Task 用。
//!   時刻順にソートでき、ノード間の調整なしで生成できる。
//! - **`CatalogId<T>`**: `u64` ベース。metadata store の行キー
//!   （table, shard, placement, colocation group）用。
//!
//! どちらも Phantom type でマーカーを持つので、`ShardId` と `TableId` のような
//! 同じ表現の ID を取り違えるとコンパイルエラーになります。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"job-", "shard-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ULID ベースのジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// `u64` ベースのカタログ ID 型
///
/// metadata store が採番する。`0` は「未採番」を表す予約値。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogId<T: IdMarker> {
    value: u64,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> CatalogId<T> {
    pub const fn new(value: u64) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> u64 {
        self.value
    }
}

impl<T: IdMarker> From<u64> for CatalogId<T> {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for CatalogId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

macro_rules! id_marker {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {}

        impl IdMarker for $name {
            fn prefix() -> &'static str {
                $prefix
            }
        }
    };
}

id_marker!(
    /// Job のマーカー型
    Job,
    "job-"
);
id_marker!(
    /// Task のマーカー型
    Task,
    "task-"
);
id_marker!(Table, "table-");
id_marker!(Shard, "shard-");
id_marker!(Placement, "placement-");
id_marker!(Colocation, "colocation-");

/// Identifier of a distributed job (one logical query).
pub type JobId = Id<Job>;

/// Identifier of a per-shard task within a job.
pub type TaskId = Id<Task>;

/// Identifier of a distributed table.
pub type TableId = CatalogId<Table>;

/// Identifier of a shard.
pub type ShardId = CatalogId<Shard>;

/// Identifier of a shard placement row.
pub type PlacementId = CatalogId<Placement>;

/// Identifier of a colocation group.
pub type ColocationId = CatalogId<Colocation>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let job = JobId::from_ulid(Ulid::new());
        let task = TaskId::from_ulid(Ulid::new());

        assert!(job.to_string().starts_with("job-"));
        assert!(task.to_string().starts_with("task-"));

        // let _: JobId = task; // <- does not compile
    }

    #[test]
    fn catalog_ids_display_with_prefix() {
        assert_eq!(ShardId::new(102008).to_string(), "shard-102008");
        assert_eq!(TableId::new(7).to_string(), "table-7");
        assert_eq!(ColocationId::new(3).get(), 3);
    }

    #[test]
    fn catalog_ids_serialize_as_plain_numbers() {
        let shard = ShardId::new(42);
        let s = serde_json::to_string(&shard).unwrap();
        assert_eq!(s, "42");
        let back: ShardId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, shard);
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = JobId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = JobId::from_ulid(Ulid::new());
        assert!(id1 < id2);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<JobId>(), size_of::<Ulid>());
        assert_eq!(size_of::<ShardId>(), size_of::<u64>());
    }
}
