//! Logical data types for schemaless records
//!
//! Every record field carries one of a closed set of logical types. The
//! engine infers a type per observed value and folds repeated observations
//! of the same field through [`DataType::join`], a lattice join that only
//! ever widens. Adapters map logical types to dialect SQL types and back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical type of a record field.
///
/// `Unknown` is a sentinel meaning "no value has pinned this field yet"
/// (only nulls were observed). It never reaches a created column: at
/// materialization time it is coerced to `String` via [`DataType::materialized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    String,
    Int64,
    Float64,
    Timestamp,
    Bool,
    Json,
    Unknown,
}

impl DataType {
    /// All concrete variants, in widening order where one exists.
    pub const ALL: [DataType; 7] = [
        DataType::Unknown,
        DataType::Bool,
        DataType::Int64,
        DataType::Float64,
        DataType::Timestamp,
        DataType::Json,
        DataType::String,
    ];

    /// Lattice join of two observed types.
    ///
    /// `Unknown` is the bottom element. `Bool ≤ Int64 ≤ Float64 ≤ String`
    /// form the numeric widening chain; `Timestamp` and `Json` sit on their
    /// own branches below `String`, so any cross-branch mix widens all the
    /// way to `String`. The operation is commutative and associative.
    pub fn join(self, other: DataType) -> DataType {
        use DataType::*;
        if self == other {
            return self;
        }
        match (self, other) {
            (Unknown, x) | (x, Unknown) => x,
            (a, b) if a.numeric_rank().is_some() && b.numeric_rank().is_some() => {
                if a.numeric_rank() >= b.numeric_rank() {
                    a
                } else {
                    b
                }
            }
            _ => String,
        }
    }

    /// Position on the `Bool → Int64 → Float64` widening chain.
    fn numeric_rank(self) -> Option<u8> {
        match self {
            DataType::Bool => Some(0),
            DataType::Int64 => Some(1),
            DataType::Float64 => Some(2),
            _ => None,
        }
    }

    /// The type a column is actually created with: `Unknown` becomes `String`.
    pub fn materialized(self) -> DataType {
        if self == DataType::Unknown {
            DataType::String
        } else {
            self
        }
    }

    /// Whether widening `self` into `other` loses nothing, i.e. a column of
    /// type `other` can hold every value of type `self`.
    pub fn fits_into(self, other: DataType) -> bool {
        self.join(other) == other
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::String => "STRING",
            DataType::Int64 => "INT64",
            DataType::Float64 => "FLOAT64",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Bool => "BOOL",
            DataType::Json => "JSON",
            DataType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STRING" => Ok(DataType::String),
            "INT64" => Ok(DataType::Int64),
            "FLOAT64" => Ok(DataType::Float64),
            "TIMESTAMP" => Ok(DataType::Timestamp),
            "BOOL" => Ok(DataType::Bool),
            "JSON" => Ok(DataType::Json),
            "UNKNOWN" => Ok(DataType::Unknown),
            other => Err(format!("unknown data type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DataType::*;

    #[test]
    fn test_join_identity() {
        for t in DataType::ALL {
            assert_eq!(t.join(t), t);
        }
    }

    #[test]
    fn test_join_unknown_is_bottom() {
        for t in DataType::ALL {
            assert_eq!(Unknown.join(t), t);
            assert_eq!(t.join(Unknown), t);
        }
    }

    #[test]
    fn test_join_numeric_chain() {
        assert_eq!(Int64.join(Float64), Float64);
        assert_eq!(Bool.join(Int64), Int64);
        assert_eq!(Bool.join(Float64), Float64);
    }

    #[test]
    fn test_join_cross_branch_widens_to_string() {
        assert_eq!(Timestamp.join(String), String);
        assert_eq!(Timestamp.join(Int64), String);
        assert_eq!(Json.join(Int64), String);
        assert_eq!(Json.join(Timestamp), String);
        assert_eq!(Json.join(String), String);
    }

    #[test]
    fn test_join_commutative() {
        for a in DataType::ALL {
            for b in DataType::ALL {
                assert_eq!(a.join(b), b.join(a), "join({a}, {b})");
            }
        }
    }

    #[test]
    fn test_join_associative() {
        for a in DataType::ALL {
            for b in DataType::ALL {
                for c in DataType::ALL {
                    assert_eq!(
                        a.join(b).join(c),
                        a.join(b.join(c)),
                        "join({a}, {b}, {c})"
                    );
                }
            }
        }
    }

    #[test]
    fn test_materialized() {
        assert_eq!(Unknown.materialized(), String);
        assert_eq!(Int64.materialized(), Int64);
    }

    #[test]
    fn test_fits_into() {
        assert!(Int64.fits_into(Float64));
        assert!(!Float64.fits_into(Int64));
        assert!(Int64.fits_into(String));
        assert!(Unknown.fits_into(Bool));
    }

    #[test]
    fn test_parse_roundtrip() {
        for t in DataType::ALL {
            assert_eq!(t.to_string().parse::<DataType>().unwrap(), t);
        }
        assert!("decimal".parse::<DataType>().is_err());
    }
}
