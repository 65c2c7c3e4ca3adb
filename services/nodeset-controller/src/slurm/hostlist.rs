//! Slurm hostlist expansion: `gpu-[01-03,7],login` to individual names.

use super::SlurmError;

/// Expand a compressed hostlist into host names, in order.
pub fn expand(hostlist: &str) -> Result<Vec<String>, SlurmError> {
    let mut hosts = Vec::new();
    for item in split_top_level(hostlist)? {
        if !item.is_empty() {
            hosts.extend(expand_item(item)?);
        }
    }
    Ok(hosts)
}

fn invalid(hostlist: &str, why: &str) -> SlurmError {
    SlurmError::Decode(format!("invalid hostlist {hostlist:?}: {why}"))
}

/// Split on commas that are not inside brackets.
fn split_top_level(s: &str) -> Result<Vec<&str>, SlurmError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| invalid(s, "unbalanced ']'"))?
            }
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(invalid(s, "unbalanced '['"));
    }
    parts.push(s[start..].trim());
    Ok(parts)
}

fn expand_item(item: &str) -> Result<Vec<String>, SlurmError> {
    let Some(open) = item.find('[') else {
        return Ok(vec![item.to_string()]);
    };
    let close = item[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| invalid(item, "unbalanced '['"))?;

    let prefix = &item[..open];
    let suffixes = expand_item(&item[close + 1..])?;

    let mut hosts = Vec::new();
    for range in item[open + 1..close].split(',') {
        let range = range.trim();
        let (lo, hi) = range.split_once('-').unwrap_or((range, range));
        let width = lo.len();
        let start: u64 = lo.parse().map_err(|_| invalid(item, "bad range start"))?;
        let end: u64 = hi.parse().map_err(|_| invalid(item, "bad range end"))?;
        if end < start {
            return Err(invalid(item, "descending range"));
        }
        for n in start..=end {
            for suffix in &suffixes {
                hosts.push(format!("{prefix}{n:0width$}{suffix}"));
            }
        }
    }
    Ok(hosts)
}
