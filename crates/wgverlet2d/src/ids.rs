//! Typed handles for the six object categories.
//!
//! Raw `u32` rows are easy to cross up between categories, so every creation
//! and lookup API trades in these wrappers instead. The wrapped value is the
//! current dense row of the object; compaction renumbers rows, so handles are
//! only stable between population passes.

macro_rules! object_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            /// The dense row index of this object.
            pub fn ix(self) -> usize {
                self.0 as usize
            }
        }

        impl From<$name> for i32 {
            fn from(id: $name) -> i32 {
                id.0 as i32
            }
        }
    };
}

object_id!(
    /// A point mass row.
    PointId
);
object_id!(
    /// A distance-constraint edge row.
    EdgeId
);
object_id!(
    /// A collision hull row.
    HullId
);
object_id!(
    /// An entity (body) row.
    EntityId
);
object_id!(
    /// A hull bone row.
    HullBoneId
);
object_id!(
    /// An entity (armature) bone row.
    EntityBoneId
);
