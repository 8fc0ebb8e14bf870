//! Value comparison for attribute criteria.

use voyage_core::types::CompareOp;

#[allow(clippy::unnecessary_map_or)]
pub fn compare_values(
    actual: &serde_json::Value,
    operator: &CompareOp,
    expected: &serde_json::Value,
) -> bool {
    match operator {
        CompareOp::Equals => actual == expected,
        CompareOp::NotEquals => actual != expected,
        CompareOp::GreaterThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Greater)
        }
        CompareOp::GreaterThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Less)
        }
        CompareOp::LessThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Less)
        }
        CompareOp::LessThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Greater)
        }
        CompareOp::Contains => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.contains(e)),
        CompareOp::NotContains => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(true, |(a, e)| !a.contains(e)),
        CompareOp::StartsWith => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.starts_with(e)),
        CompareOp::EndsWith => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.ends_with(e)),
        CompareOp::IsSet => !actual.is_null(),
        CompareOp::IsNotSet => actual.is_null(),
        CompareOp::InList => expected
            .as_array()
            .map_or(false, |list| list.contains(actual)),
        CompareOp::NotInList => expected
            .as_array()
            .map_or(true, |list| !list.contains(actual)),
    }
}

fn numeric_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    let a_num = a.as_f64()?;
    let b_num = b.as_f64()?;
    a_num.partial_cmp(&b_num)
}
