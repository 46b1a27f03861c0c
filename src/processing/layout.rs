/// Dimensions that fit `src_w` x `src_h` inside a `max_dim` square.
///
/// Images already within bounds keep their size. Otherwise the larger side
/// becomes `max_dim` and the other side is scaled by the same ratio, truncated
/// toward zero (never rounded) and clamped to at least one pixel.
pub fn fit_within(src_w: u32, src_h: u32, max_dim: u32) -> (u32, u32) {
    if src_w <= max_dim && src_h <= max_dim {
        return (src_w, src_h);
    }
    let max = u64::from(max_dim);
    if src_w > src_h {
        let h = u64::from(src_h) * max / u64::from(src_w);
        (max_dim, (h as u32).max(1))
    } else {
        let w = u64::from(src_w) * max / u64::from(src_h);
        ((w as u32).max(1), max_dim)
    }
}

/// True when [`fit_within`] would change the dimensions.
pub fn needs_downscale(src_w: u32, src_h: u32, max_dim: u32) -> bool {
    src_w > max_dim || src_h > max_dim
}
