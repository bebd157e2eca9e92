//! Partition planning
//!
//! Pure computation of partition names and bounds for each strategy; the
//! manager turns the resulting [`PartitionSpec`]s into DDL.

use crate::database::schema::{derived_identifier, qualified, quote_literal};
use crate::error::{Result, TenantForgeError};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Months created up front for date-range tables
pub const INITIAL_MONTHS: u32 = 12;

/// Native partitioning method of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMethod {
    Range,
    List,
    Hash,
}

impl PartitionMethod {
    pub fn as_sql(&self) -> &'static str {
        match self {
            PartitionMethod::Range => "RANGE",
            PartitionMethod::List => "LIST",
            PartitionMethod::Hash => "HASH",
        }
    }

    /// Hash partitioned tables cannot have a default partition
    pub fn supports_default(&self) -> bool {
        !matches!(self, PartitionMethod::Hash)
    }
}

/// How a table is split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Monthly ranges over a date/timestamp column
    RangeDate,
    /// `buckets` ranges of `width` starting at `start`
    RangeNumeric { start: i64, width: i64, buckets: u32 },
    /// One partition per value
    List { values: Vec<String> },
    /// `partitions` buckets by hash modulus
    Hash { partitions: u32 },
}

impl PartitionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            PartitionStrategy::RangeDate => "range_date",
            PartitionStrategy::RangeNumeric { .. } => "range_numeric",
            PartitionStrategy::List { .. } => "list",
            PartitionStrategy::Hash { .. } => "hash",
        }
    }

    pub fn method(&self) -> PartitionMethod {
        match self {
            PartitionStrategy::RangeDate | PartitionStrategy::RangeNumeric { .. } => {
                PartitionMethod::Range
            }
            PartitionStrategy::List { .. } => PartitionMethod::List,
            PartitionStrategy::Hash { .. } => PartitionMethod::Hash,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let problem = match self {
            PartitionStrategy::RangeDate => None,
            PartitionStrategy::RangeNumeric { width, buckets, .. } if *width <= 0 || *buckets == 0 => {
                Some("range_numeric needs a positive width and at least one bucket")
            }
            PartitionStrategy::RangeNumeric { start, width, buckets } => {
                let span = width.checked_mul(i64::from(*buckets));
                match span.and_then(|span| start.checked_add(span)) {
                    Some(_) => None,
                    None => Some("range_numeric bounds overflow a 64-bit integer"),
                }
            }
            PartitionStrategy::List { values } if values.is_empty() => {
                Some("list partitioning needs at least one value")
            }
            PartitionStrategy::List { .. } => None,
            PartitionStrategy::Hash { partitions } if *partitions == 0 => {
                Some("hash partitioning needs at least one partition")
            }
            PartitionStrategy::Hash { .. } => None,
        };
        match problem {
            Some(message) => Err(TenantForgeError::InvalidInput(message.to_string())),
            None => Ok(()),
        }
    }
}

/// Bounds of one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionBounds {
    /// `FROM (from) TO (to)`; values are already SQL literals
    Range { from: String, to: String },
    List { values: Vec<String> },
    Hash { modulus: u32, remainder: u32 },
    Default,
}

impl fmt::Display for PartitionBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionBounds::Range { from, to } => write!(f, "FOR VALUES FROM ({}) TO ({})", from, to),
            PartitionBounds::List { values } => {
                let literals: Vec<String> = values.iter().map(|v| quote_literal(v)).collect();
                write!(f, "FOR VALUES IN ({})", literals.join(", "))
            }
            PartitionBounds::Hash { modulus, remainder } => write!(
                f,
                "FOR VALUES WITH (MODULUS {}, REMAINDER {})",
                modulus, remainder
            ),
            PartitionBounds::Default => write!(f, "DEFAULT"),
        }
    }
}

/// A partition to create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub name: String,
    pub bounds: PartitionBounds,
}

impl PartitionSpec {
    /// `CREATE TABLE ... PARTITION OF ...`
    pub fn create_sql(&self, schema: &str, parent: &str) -> Result<String> {
        Ok(format!(
            "CREATE TABLE {} PARTITION OF {} {}",
            qualified(schema, &self.name)?,
            qualified(schema, parent)?,
            self.bounds
        ))
    }
}

/// First instant of the month containing `at`
pub fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    month_of(at.year(), at.month())
}

fn month_of(year: i32, month: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// First instant of the month `offset` months after the one starting at `start`
pub fn add_months(start: DateTime<Utc>, offset: i32) -> DateTime<Utc> {
    let index = start.year() * 12 + start.month0() as i32 + offset;
    month_of(index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

/// Partition holding the month that starts at `start`
pub fn monthly_partition(table: &str, start: DateTime<Utc>) -> PartitionSpec {
    let end = add_months(start, 1);
    PartitionSpec {
        name: derived_identifier(table, &format!("_p{:04}_{:02}", start.year(), start.month())),
        bounds: PartitionBounds::Range {
            from: quote_literal(&start.format("%Y-%m-%d").to_string()),
            to: quote_literal(&end.format("%Y-%m-%d").to_string()),
        },
    }
}

/// Month start encoded in a `<table>_pYYYY_MM` partition name. The table
/// part may be shortened the same way [`monthly_partition`] shortens it.
pub fn parse_monthly_name(table: &str, partition: &str) -> Option<DateTime<Utc>> {
    let split = partition.len().checked_sub("_pYYYY_MM".len())?;
    if !partition.is_char_boundary(split) {
        return None;
    }
    let suffix = &partition[split..];
    if derived_identifier(table, suffix) != partition {
        return None;
    }
    let (year, month) = suffix.strip_prefix("_p")?.split_once('_')?;
    if year.len() != 4 || month.len() != 2 {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(month_of(year, month))
}

/// Default partition spec
pub fn default_partition(table: &str) -> PartitionSpec {
    PartitionSpec {
        name: derived_identifier(table, "_default"),
        bounds: PartitionBounds::Default,
    }
}

/// Upper bound for look-ahead and retention windows, in months
pub const MAX_PLANNING_MONTHS: u32 = 1200;

/// Partitions to create for a fresh table, starting at `now` for date ranges
pub fn initial_partitions(table: &str, strategy: &PartitionStrategy, now: DateTime<Utc>) -> Result<Vec<PartitionSpec>> {
    strategy.validate()?;

    let specs = match strategy {
        PartitionStrategy::RangeDate => {
            let first = month_start(now);
            (0..INITIAL_MONTHS as i32)
                .map(|i| monthly_partition(table, add_months(first, i)))
                .collect()
        }
        PartitionStrategy::Hash { partitions } => (0..*partitions)
            .map(|remainder| PartitionSpec {
                name: derived_identifier(table, &format!("_h{}", remainder)),
                bounds: PartitionBounds::Hash {
                    modulus: *partitions,
                    remainder,
                },
            })
            .collect(),
        PartitionStrategy::List { values } => values
            .iter()
            .enumerate()
            .map(|(i, value)| PartitionSpec {
                name: derived_identifier(table, &format!("_l{}", i)),
                bounds: PartitionBounds::List {
                    values: vec![value.clone()],
                },
            })
            .collect(),
        PartitionStrategy::RangeNumeric { start, width, buckets } => (0..*buckets)
            .map(|i| {
                let from = start + i64::from(i) * width;
                PartitionSpec {
                    name: derived_identifier(table, &format!("_n{}", i)),
                    bounds: PartitionBounds::Range {
                        from: from.to_string(),
                        to: (from + width).to_string(),
                    },
                }
            })
            .collect(),
    };
    Ok(specs)
}

/// Monthly partitions needed so that months up to `now + look_ahead` exist
pub fn look_ahead_partitions(
    table: &str,
    existing: &[String],
    look_ahead: u32,
    now: DateTime<Utc>,
) -> Vec<PartitionSpec> {
    let first = month_start(now);
    (0..=look_ahead.min(MAX_PLANNING_MONTHS) as i32)
        .map(|i| monthly_partition(table, add_months(first, i)))
        .filter(|spec| !existing.contains(&spec.name))
        .collect()
}

/// Monthly partitions whose whole month ends before the retention cutoff
pub fn expired_partitions(
    table: &str,
    existing: &[String],
    retention_months: u32,
    now: DateTime<Utc>,
) -> Vec<String> {
    let cutoff = add_months(month_start(now), -(retention_months.min(MAX_PLANNING_MONTHS) as i32));
    existing
        .iter()
        .filter(|name| {
            parse_monthly_name(table, name)
                .map(|start| add_months(start, 1) <= cutoff)
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

impl FromStr for PartitionStrategy {
    type Err = TenantForgeError;

    /// Parse `range_date`, `hash:<n>`, `list:a,b,c` or
    /// `range_numeric:<start>:<width>:<buckets>`
    fn from_str(s: &str) -> Result<Self> {
        let (kind, args) = s.split_once(':').unwrap_or((s, ""));
        let invalid = || TenantForgeError::InvalidInput(format!("invalid partition strategy: {}", s));

        let strategy = match kind {
            "range_date" => PartitionStrategy::RangeDate,
            "hash" => PartitionStrategy::Hash {
                partitions: args.parse().map_err(|_| invalid())?,
            },
            "list" => PartitionStrategy::List {
                values: args
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            "range_numeric" => {
                let parts: Vec<&str> = args.split(':').collect();
                match parts.as_slice() {
                    [start, width, buckets] => PartitionStrategy::RangeNumeric {
                        start: start.parse().map_err(|_| invalid())?,
                        width: width.parse().map_err(|_| invalid())?,
                        buckets: buckets.parse().map_err(|_| invalid())?,
                    },
                    _ => return Err(invalid()),
                }
            }
            _ => return Err(invalid()),
        };
        strategy.validate()?;
        Ok(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::schema::MAX_IDENTIFIER_LEN;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_hash_partitions_cover_all_remainders() {
        let specs = initial_partitions("t", &PartitionStrategy::Hash { partitions: 4 }, Utc::now()).unwrap();
        assert_eq!(specs.len(), 4);
        for (i, spec) in specs.iter().enumerate() {
            assert_eq!(spec.name, format!("t_h{}", i));
            assert_eq!(
                spec.bounds,
                PartitionBounds::Hash {
                    modulus: 4,
                    remainder: i as u32
                }
            );
        }
        assert_eq!(
            specs[3].create_sql("s", "t").unwrap(),
            "CREATE TABLE \"s\".\"t_h3\" PARTITION OF \"s\".\"t\" FOR VALUES WITH (MODULUS 4, REMAINDER 3)"
        );
    }

    #[test]
    fn test_range_date_creates_twelve_months() {
        let specs = initial_partitions("pedidos", &PartitionStrategy::RangeDate, at(2024, 11, 15)).unwrap();
        assert_eq!(specs.len(), 12);
        assert_eq!(specs[0].name, "pedidos_p2024_11");
        assert_eq!(specs[1].name, "pedidos_p2024_12");
        assert_eq!(specs[2].name, "pedidos_p2025_01");
        assert_eq!(
            specs[0].bounds,
            PartitionBounds::Range {
                from: "'2024-11-01'".to_string(),
                to: "'2024-12-01'".to_string()
            }
        );
    }

    #[test]
    fn test_numeric_buckets_are_contiguous() {
        let strategy = PartitionStrategy::RangeNumeric {
            start: 0,
            width: 1000,
            buckets: 3,
        };
        let specs = initial_partitions("n", &strategy, Utc::now()).unwrap();
        assert_eq!(specs[2].bounds.to_string(), "FOR VALUES FROM (2000) TO (3000)");
    }

    #[test]
    fn test_list_partition_literals() {
        let strategy = PartitionStrategy::List {
            values: vec!["sul".to_string(), "d'oeste".to_string()],
        };
        let specs = initial_partitions("r", &strategy, Utc::now()).unwrap();
        assert_eq!(specs[1].bounds.to_string(), "FOR VALUES IN ('d''oeste')");
    }

    #[test]
    fn test_add_months_across_years() {
        assert_eq!(add_months(month_of(2024, 1), -1), month_of(2023, 12));
        assert_eq!(add_months(month_of(2024, 12), 13), month_of(2026, 1));
    }

    #[test]
    fn test_look_ahead_skips_existing() {
        let existing = vec!["t_p2024_05".to_string()];
        let specs = look_ahead_partitions("t", &existing, 2, at(2024, 5, 20));
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["t_p2024_06", "t_p2024_07"]);
    }

    #[test]
    fn test_expired_partitions() {
        let existing = vec![
            "t_p2023_12".to_string(),
            "t_p2024_01".to_string(),
            "t_p2024_02".to_string(),
            "t_default".to_string(),
        ];
        let expired = expired_partitions("t", &existing, 3, at(2024, 5, 10));
        assert_eq!(expired, vec!["t_p2023_12", "t_p2024_01"]);
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("hash:4".parse::<PartitionStrategy>().unwrap(), PartitionStrategy::Hash { partitions: 4 });
        assert_eq!(
            "range_numeric:0:100:5".parse::<PartitionStrategy>().unwrap(),
            PartitionStrategy::RangeNumeric { start: 0, width: 100, buckets: 5 }
        );
        assert!("hash:0".parse::<PartitionStrategy>().is_err());
        assert!("list:".parse::<PartitionStrategy>().is_err());
        assert!("zigzag".parse::<PartitionStrategy>().is_err());
    }

    #[test]
    fn test_numeric_bounds_must_fit_in_i64() {
        let near_max = format!("range_numeric:{}:100:2", i64::MAX - 10);
        assert!(near_max.parse::<PartitionStrategy>().is_err());

        let strategy = PartitionStrategy::RangeNumeric {
            start: i64::MAX - 10,
            width: 100,
            buckets: 2,
        };
        assert!(matches!(
            initial_partitions("n", &strategy, Utc::now()),
            Err(TenantForgeError::InvalidInput(_))
        ));

        let wide = PartitionStrategy::RangeNumeric {
            start: 0,
            width: i64::MAX,
            buckets: 2,
        };
        assert!(wide.validate().is_err());

        let last_fit = PartitionStrategy::RangeNumeric {
            start: i64::MAX - 200,
            width: 100,
            buckets: 2,
        };
        let specs = initial_partitions("n", &last_fit, Utc::now()).unwrap();
        assert_eq!(specs[1].bounds.to_string(), format!("FOR VALUES FROM ({}) TO ({})", i64::MAX - 100, i64::MAX));
    }

    #[test]
    fn test_long_table_names_still_expire() {
        let table = "a".repeat(60);
        let old = monthly_partition(&table, month_of(2020, 1)).name;
        let recent = monthly_partition(&table, month_of(2026, 9)).name;
        assert_eq!(old.len(), MAX_IDENTIFIER_LEN);

        assert_eq!(parse_monthly_name(&table, &old), Some(month_of(2020, 1)));
        let expired = expired_partitions(&table, &[old.clone(), recent], 12, at(2026, 10, 1));
        assert_eq!(expired, vec![old]);

        // a shortened name of some other table does not match
        assert_eq!(parse_monthly_name(&"b".repeat(60), &monthly_partition(&table, month_of(2020, 1)).name), None);
        assert_eq!(parse_monthly_name("t", "t_default"), None);
    }

    #[test]
    fn test_oversized_windows_are_clamped() {
        let specs = look_ahead_partitions("t", &[], u32::MAX, at(2024, 5, 1));
        assert_eq!(specs.len(), MAX_PLANNING_MONTHS as usize + 1);
        let existing = vec!["t_p2024_04".to_string()];
        assert!(expired_partitions("t", &existing, u32::MAX, at(2024, 5, 1)).is_empty());
    }
}
