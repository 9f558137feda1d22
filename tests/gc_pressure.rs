//! Garbage-collection behavior under real programs with small heaps.

use ember::{interpret_with_config, EmberError, HeapConfig};

/// A heap small enough that list-building programs must collect.
fn tiny_heap() -> HeapConfig {
    HeapConfig {
        eden_bytes: 4 * 1024,
        survivor_bytes: 4 * 1024,
        old_bytes: 64 * 1024,
        promotion_age: 3,
    }
}

const BUILD_AND_SUM: &str = "\
(define build (lambda (n acc) (if (= n 0) acc (build (- n 1) (cons n acc)))))\n\
(define sum (lambda (l) (if (null? l) 0 (+ (car l) (sum (cdr l))))))\n";

#[test]
fn live_lists_survive_minor_collections() {
    let src = format!("{}(sum (build 100 nil))", BUILD_AND_SUM);
    let result = interpret_with_config(&src, tiny_heap());
    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert_eq!(result.values.last().unwrap(), "5050");
    assert!(
        result.stats.minor_collections > 0,
        "a 100-cell list cannot fit a 4 KiB eden without collecting"
    );
}

#[test]
fn garbage_churn_does_not_grow_the_heap() {
    // Build and discard many short-lived lists; only the final sum is live.
    let src = format!(
        "{}\
         (define churn (lambda (n acc) (if (= n 0) acc (churn (- n 1) (+ acc (sum (build 20 nil)))))))\n\
         (churn 50 0)",
        BUILD_AND_SUM
    );
    let result = interpret_with_config(&src, tiny_heap());
    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert_eq!(result.values.last().unwrap(), "10500");
    assert!(result.stats.minor_collections > 1);
}

#[test]
fn long_lived_data_promotes_to_the_old_generation() {
    let src = format!(
        "{}\
         (define keep (build 60 nil))\n\
         (define churn (lambda (n) (if (= n 0) nil (churn (- n 1)))))\n\
         (churn 200)\n\
         (sum keep)",
        BUILD_AND_SUM
    );
    let config = HeapConfig {
        eden_bytes: 2 * 1024,
        survivor_bytes: 2 * 1024,
        old_bytes: 64 * 1024,
        promotion_age: 2,
    };
    let result = interpret_with_config(&src, config);
    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert_eq!(result.values.last().unwrap(), "1830");
    assert!(
        result.stats.bytes_promoted > 0,
        "a 60-cell list outliving a 2 KiB nursery must promote"
    );
}

#[test]
fn exceeding_the_old_generation_is_out_of_memory() {
    // A rooted list far larger than every region together.
    let src = format!("{}(define big (build 5000 nil)) (sum big)", BUILD_AND_SUM);
    let config = HeapConfig {
        eden_bytes: 4 * 1024,
        survivor_bytes: 2 * 1024,
        old_bytes: 8 * 1024,
        promotion_age: 3,
    };
    let result = interpret_with_config(&src, config);
    assert!(
        matches!(result.error, Some(EmberError::OutOfMemory { .. })),
        "expected out-of-memory, got {:?}",
        result.error
    );
}

#[test]
fn major_collection_reclaims_dead_promoted_data() {
    // Two generations of "keep" lists; rebinding is impossible (define is
    // const), so use a lambda frame that drops its binding when it pops.
    let src = format!(
        "{}\
         (define work (lambda (n) (sum (build n nil))))\n\
         (define spin (lambda (n acc) (if (= n 0) acc (spin (- n 1) (+ acc (work 40))))))\n\
         (spin 120 0)",
        BUILD_AND_SUM
    );
    let config = HeapConfig {
        eden_bytes: 2 * 1024,
        survivor_bytes: 1024,
        old_bytes: 12 * 1024,
        promotion_age: 1,
    };
    let result = interpret_with_config(&src, config);
    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert_eq!(result.values.last().unwrap(), "98400");
    // With promotion at age 1 and a 12 KiB old generation, the churn can
    // only complete if major collections reclaim dead promoted lists.
    assert!(result.stats.major_collections > 0);
}

#[test]
fn shared_structure_stays_shared_across_collections() {
    // One cell reachable through two paths must be evacuated once, not
    // duplicated: `eq?` still holds after the churn forces collections.
    let src = format!(
        "{}\
         (define tail (list 8 9))\n\
         (define both (cons tail tail))\n\
         (sum (build 100 nil))\n\
         (eq? (car both) (cdr both))",
        BUILD_AND_SUM
    );
    let result = interpret_with_config(&src, tiny_heap());
    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert!(result.stats.minor_collections > 0);
    assert_eq!(result.values.last().unwrap(), "#t");
}

#[test]
fn default_heap_runs_without_collections_for_small_programs() {
    let result = interpret_with_config("(+ 1 2)", HeapConfig::default());
    assert!(result.error.is_none());
    assert_eq!(result.stats.minor_collections, 0);
    assert_eq!(result.stats.major_collections, 0);
}
