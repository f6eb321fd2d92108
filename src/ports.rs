use std::ops::RangeInclusive;

use anyhow::{bail, Context, Result};

/// A validated `port_range` scan parameter.
///
/// Supported formats, items separated by commas:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - whitespace around items is ignored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    ranges: Vec<RangeInclusive<u16>>,
}

impl PortSpec {
    /// Ranges in the order they were written, overlaps merged into the earlier item.
    pub fn ranges(&self) -> &[RangeInclusive<u16>] {
        &self.ranges
    }

    /// Number of distinct ports covered.
    pub fn port_count(&self) -> usize {
        let mut sorted = self.ranges.clone();
        sorted.sort_by_key(|r| *r.start());
        let mut count = 0usize;
        let mut covered_to: u32 = 0;
        for r in sorted {
            let start = u32::from(*r.start()).max(covered_to + 1);
            let end = u32::from(*r.end());
            if end >= start {
                count += (end - start + 1) as usize;
                covered_to = end;
            }
        }
        count
    }
}

/// Parse a `port_range` string into a [`PortSpec`] (ports 1..=65535).
pub fn parse_port_range(s: &str) -> Result<PortSpec> {
    let mut ranges: Vec<RangeInclusive<u16>> = Vec::new();

    for (idx, raw_item) in s.split(',').enumerate() {
        let item_no = idx + 1;
        let item = raw_item.trim();
        if item.is_empty() {
            bail!("item {item_no}: empty port entry");
        }

        // Range `start-end`
        let range = if let Some((a, b)) = item.split_once('-') {
            let start = parse_port_str(a.trim())
                .with_context(|| format!("item {item_no}: invalid start in range: {a}"))?;
            let end = parse_port_str(b.trim())
                .with_context(|| format!("item {item_no}: invalid end in range: {b}"))?;
            if start > end {
                bail!("item {item_no}: invalid range {start}-{end} (start > end)");
            }
            start..=end
        } else {
            let p = parse_port_str(item)
                .with_context(|| format!("item {item_no}: invalid port value: {item}"))?;
            p..=p
        };

        if !ranges
            .iter()
            .any(|r| r.start() <= range.start() && r.end() >= range.end())
        {
            ranges.push(range);
        }
    }

    Ok(PortSpec { ranges })
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ports() {
        let spec = parse_port_range("80, 22 ,443").unwrap();
        assert_eq!(spec.ranges(), &[80..=80, 22..=22, 443..=443]);
        assert_eq!(spec.port_count(), 3);
    }

    #[test]
    fn parse_default_range() {
        let spec = parse_port_range("1-1000").unwrap();
        assert_eq!(spec.port_count(), 1000);
    }

    #[test]
    fn contained_items_are_dropped_and_overlaps_counted_once() {
        let spec = parse_port_range("8000-8010,8005,8008-8020").unwrap();
        assert_eq!(spec.ranges(), &[8000..=8010, 8008..=8020]);
        assert_eq!(spec.port_count(), 21);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_port_range("70000").is_err());
        assert!(parse_port_range("0").is_err());
        assert!(parse_port_range("100-10").is_err());
        assert!(parse_port_range("80,,443").is_err());
        assert!(parse_port_range("http").is_err());
    }
}
