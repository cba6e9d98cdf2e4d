// Port range specs such as "6000-6006,6007".

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("Empty range spec")]
    Empty,

    #[error("Invalid port number: {0}")]
    InvalidNumber(String),

    #[error("Range end is before its start: {0}")]
    Reversed(String),

    #[error("Malformed range part: {0}")]
    Malformed(String),
}

/// Expand a comma separated list of ports and inclusive `start-end` ranges,
/// keeping the written order.
pub fn parse_range_numbers(spec: &str) -> Result<Vec<u16>, RangeError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(RangeError::Empty);
    }

    let mut numbers = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let bounds: Vec<&str> = part.split('-').collect();
        match bounds.as_slice() {
            [single] => numbers.push(parse_port(single)?),
            [start, end] => {
                let start = parse_port(start)?;
                let end = parse_port(end)?;
                if end < start {
                    return Err(RangeError::Reversed(part.to_string()));
                }
                numbers.extend(start..=end);
            }
            _ => return Err(RangeError::Malformed(part.to_string())),
        }
    }
    Ok(numbers)
}

fn parse_port(raw: &str) -> Result<u16, RangeError> {
    let raw = raw.trim();
    raw.parse::<u16>()
        .map_err(|_| RangeError::InvalidNumber(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_ranges_and_singles() {
        let ports = parse_range_numbers("6000-6006,6007").unwrap();
        assert_eq!(ports.len(), 8);
        assert_eq!(ports.first(), Some(&6000));
        assert_eq!(ports.last(), Some(&6007));
    }

    #[test]
    fn test_order_is_preserved() {
        assert_eq!(
            parse_range_numbers(" 9000, 22 ,80-81").unwrap(),
            vec![9000, 22, 80, 81]
        );
    }

    #[test]
    fn test_invalid_specs() {
        assert_eq!(parse_range_numbers(""), Err(RangeError::Empty));
        assert_eq!(
            parse_range_numbers("6006-6000"),
            Err(RangeError::Reversed("6006-6000".to_string()))
        );
        assert!(matches!(
            parse_range_numbers("1-2-3"),
            Err(RangeError::Malformed(_))
        ));
        assert!(matches!(
            parse_range_numbers("80,http"),
            Err(RangeError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_range_numbers("70000"),
            Err(RangeError::InvalidNumber(_))
        ));
    }
}
