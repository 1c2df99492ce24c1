use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generates a new random id.
            pub fn random() -> Self {
                $name(random_id())
            }

            /// Borrowed string form.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name(value)
            }
        }
    };
}

string_id!(
    /// Identifies one running client instance.
    ClientId
);
string_id!(
    /// Identifies a branch shared by one or more clients.
    BranchId
);

/// Per-client mutation counters. Ordered so encoded chunks are deterministic.
pub type MutationIds = BTreeMap<ClientId, u64>;

/// 128 random bits as lowercase hex.
pub fn random_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}
