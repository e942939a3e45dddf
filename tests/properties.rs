use data_collection::types::Value;
use data_collection::{DataCollection, Record};
use proptest::prelude::*;

fn values(xs: &[i64]) -> Vec<Value> {
    xs.iter().copied().map(Value::Int64).collect()
}

fn source(xs: &[i64], stream: bool) -> DataCollection {
    let dc = DataCollection::of(values(xs));
    if stream { dc.stream() } else { dc }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn parallel_map_matches_serial_map(xs in prop::collection::vec(-1000i64..1000, 0..60), workers in 1usize..5) {
        let f = |v: Value| Value::Int64(v.as_i64().unwrap_or(0) * 7 - 1);
        let serial = source(&xs, false).map(f).to_list();
        let parallel = source(&xs, true)
            .set_parallel(Some(workers), "thread")
            .unwrap()
            .map(f)
            .to_list();
        prop_assert_eq!(serial, parallel);
    }

    #[test]
    fn batch_then_flatten_restores_input(xs in prop::collection::vec(any::<i64>(), 0..50), size in 1usize..8) {
        let out = source(&xs, true).batch(size, false).unwrap().flatten().unwrap().to_list();
        prop_assert_eq!(out, values(&xs));
    }

    #[test]
    fn batches_have_requested_size(xs in prop::collection::vec(any::<i64>(), 0..50), size in 1usize..8) {
        let out = source(&xs, false).batch(size, true).unwrap().to_list();
        prop_assert_eq!(out.len(), xs.len() / size);
        for b in &out {
            prop_assert_eq!(b.as_list().map(<[Value]>::len), Some(size));
        }
    }

    #[test]
    fn full_rolling_windows_are_contiguous(xs in prop::collection::vec(any::<i64>(), 0..40), size in 1usize..6) {
        let out = source(&xs, false).rolling(size, 1, true, true).unwrap().to_list();
        prop_assert_eq!(out.len(), (xs.len() + 1).saturating_sub(size));
        for (i, w) in out.iter().enumerate() {
            prop_assert_eq!(w.as_list().map(<[Value]>::to_vec), Some(values(&xs[i..i + size])));
        }
    }

    #[test]
    fn split_branches_see_every_element(xs in prop::collection::vec(any::<i64>(), 0..40), count in 1usize..5, stream in any::<bool>()) {
        let mut branches = source(&xs, stream).split(count);
        let first = branches.remove(0);
        let zipped = first.zip(branches).to_list();
        prop_assert_eq!(zipped.len(), xs.len());
        for (row, x) in zipped.iter().zip(&xs) {
            let row = row.as_list().unwrap_or_default();
            prop_assert_eq!(row.len(), count);
            prop_assert!(row.iter().all(|v| v.as_i64() == Some(*x)));
        }
    }

    #[test]
    fn filter_is_order_preserving_subsequence(xs in prop::collection::vec(-50i64..50, 0..60)) {
        let out = source(&xs, true).filter(|v| v.as_i64().is_some_and(|x| x % 3 == 0), false).to_list();
        let expected: Vec<i64> = xs.iter().copied().filter(|x| x % 3 == 0).collect();
        prop_assert_eq!(out, values(&expected));
    }

    #[test]
    fn column_apply_matches_row_apply(xs in prop::collection::vec(-100i64..100, 1..40), chunk in 1usize..7) {
        let rows = || DataCollection::of(xs.iter().map(|x| Record::new().with("a", *x)));
        let f = |v: Value| Value::Int64(v.as_i64().unwrap_or(0) + 1);
        let by_row = rows().runas_op(("a", "b"), f).unwrap().to_list();
        let by_chunk = rows().set_chunksize(chunk).unwrap().runas_op(("a", "b"), f).unwrap().to_list();
        let b = |out: &[Value]| -> Vec<Value> {
            out.iter().map(|v| v.as_record().and_then(|r| r.get("b")).unwrap_or_default()).collect()
        };
        prop_assert_eq!(b(&by_row), b(&by_chunk));
    }
}
