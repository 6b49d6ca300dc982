//! Striping math: how many backend objects a file of a given size spans

use reclaim_common::FileLayout;

/// Number of backend objects holding the first `size` bytes of a file
///
/// Data is laid out in periods of `stripe_count` objects; within the last,
/// partial period only the objects that received a stripe unit exist. An
/// empty file still counts its first object. Layouts with a zero dimension
/// are treated as a single object.
#[must_use]
pub fn striped_object_count(layout: &FileLayout, size: u64) -> u64 {
    let stripe_unit = u64::from(layout.stripe_unit);
    let stripe_count = u64::from(layout.stripe_count);
    let period = layout.period();
    if size == 0 || stripe_unit == 0 || period == 0 {
        return 1;
    }

    let num_periods = size.div_ceil(period);
    let remainder_bytes = size % period;
    let remainder_objs = if remainder_bytes > 0 && remainder_bytes < stripe_count * stripe_unit {
        stripe_count - remainder_bytes.div_ceil(stripe_unit)
    } else {
        0
    };

    num_periods * stripe_count - remainder_objs
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_common::PoolId;

    const MIB: u64 = 1 << 20;

    fn striped(stripe_unit: u32, stripe_count: u32, object_size: u32) -> FileLayout {
        FileLayout {
            stripe_unit,
            stripe_count,
            object_size,
            ..FileLayout::default_for_pool(PoolId::new(1))
        }
    }

    #[test]
    fn test_default_layout() {
        let layout = FileLayout::default_for_pool(PoolId::new(1));
        assert_eq!(striped_object_count(&layout, 0), 1);
        assert_eq!(striped_object_count(&layout, 1), 1);
        assert_eq!(striped_object_count(&layout, 4 * MIB), 1);
        assert_eq!(striped_object_count(&layout, 4 * MIB + 1), 2);
        assert_eq!(striped_object_count(&layout, 16 * MIB + 1), 5);
    }

    #[test]
    fn test_partial_period() {
        // 1 MiB units over 4 objects of 4 MiB: a 16 MiB period
        let layout = striped(1 << 20, 4, 4 << 20);
        // Two units only touch the first two objects
        assert_eq!(striped_object_count(&layout, 2 * MIB), 2);
        // One full round of units touches all four
        assert_eq!(striped_object_count(&layout, 4 * MIB), 4);
        assert_eq!(striped_object_count(&layout, 10 * MIB), 4);
        // Into the second period
        assert_eq!(striped_object_count(&layout, 16 * MIB + 1), 5);
    }

    #[test]
    fn test_degenerate_layout() {
        assert_eq!(striped_object_count(&striped(0, 1, 0), 100), 1);
    }
}
