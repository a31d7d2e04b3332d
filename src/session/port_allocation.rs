use std::ops::Range;

/// Picks the first port in `[max(port_b, range.start), range.end)` for which `is_taken` returns
///  `false`, probing upwards one port at a time. Returns `None` if all candidates are taken.
pub fn first_free_port(port_b: u16, range: &Range<u16>, mut is_taken: impl FnMut(u16) -> bool) -> Option<u16> {
    let start = port_b.max(range.start);
    (start..range.end)
        .find(|&candidate| !is_taken(candidate))
}
