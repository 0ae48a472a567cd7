mod common;

use std::collections::HashMap;

use jrl::{BatchGenerator, Config, CursorState, DataError};

fn small_config() -> Config {
    Config {
        window_size: 2,
        negative_sample: 1,
        batch_size: 8,
        subsampling_rate: 0.0,
        max_train_epoch: 1,
        ..Config::default()
    }
}

#[test]
fn two_users_fill_exactly_one_batch() {
    let data = common::in_memory(6, 2, 3, &[(0, 0, &[0, 1, 2, 3]), (1, 1, &[4, 5, 0, 2])]);
    let config = small_config();
    let mut gen = BatchGenerator::new(&data, &config);
    gen.initialize_epoch(vec![0, 1]);

    let batch = gen.get_train_batch().unwrap();
    assert_eq!(batch.len(), 8);
    assert!(batch.has_next);
    assert_eq!(batch.word_idxs, vec![0, 1, 2, 3, 4, 5, 0, 2]);
    assert_eq!(batch.review_idxs, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    assert_eq!(batch.user_idxs, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    assert_eq!(batch.product_idxs, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    // windows are truncated at the review edges
    assert_eq!(batch.context_word_idxs[0], vec![1, 2]);
    assert_eq!(batch.context_word_idxs[1], vec![0, 2, 3]);
    assert_eq!(batch.context_word_idxs[2], vec![0, 1, 3]);
    assert_eq!(batch.context_word_idxs[3], vec![1, 2]);
    for i in 0..batch.len() {
        let negatives = &batch.negative_word_idxs[i];
        assert!(negatives.len() <= 1);
        for n in negatives {
            assert_ne!(*n, batch.word_idxs[i]);
            assert!(!batch.context_word_idxs[i].contains(n));
        }
        for q in &batch.negative_product_idxs[i] {
            assert_ne!(*q, batch.product_idxs[i]);
        }
    }

    let last = gen.get_train_batch().unwrap();
    assert!(last.is_empty());
    assert!(!last.has_next);
    assert_eq!(gen.cursor().state, CursorState::EpochDone);

    assert!(matches!(gen.get_train_batch(), Err(DataError::EpochExhausted)));
    assert!(matches!(gen.get_test_batch(), Err(DataError::EpochExhausted)));

    gen.initialize_epoch(vec![1, 0]);
    let again = gen.get_train_batch().unwrap();
    assert_eq!(again.word_idxs, vec![4, 5, 0, 2, 0, 1, 2, 3]);
}

#[test]
fn nothing_before_the_first_epoch() {
    let data = common::in_memory(3, 1, 1, &[(0, 0, &[0, 1, 2])]);
    let config = small_config();
    let mut gen = BatchGenerator::new(&data, &config);
    assert!(matches!(gen.get_train_batch(), Err(DataError::EpochExhausted)));
}

#[test]
fn a_partial_last_batch_ends_the_epoch() {
    let data = common::in_memory(4, 1, 1, &[(0, 0, &[0, 1, 2]), (0, 0, &[3, 0])]);
    let config = Config {
        batch_size: 4,
        ..small_config()
    };
    let mut gen = BatchGenerator::new(&data, &config);
    gen.initialize_epoch(vec![0, 1]);

    let first = gen.get_train_batch().unwrap();
    assert_eq!(first.len(), 4);
    assert!(first.has_next);
    // the second review is split across batches
    assert_eq!(first.review_idxs, vec![0, 0, 0, 1]);

    let second = gen.get_train_batch().unwrap();
    assert_eq!(second.len(), 1);
    assert!(!second.has_next);
}

#[test]
fn every_word_is_visited_once_per_epoch() {
    let reviews: Vec<(usize, usize, Vec<usize>)> = (0..7)
        .map(|r| (r % 3, r % 4, (0..(r + 1)).map(|i| (i * 3 + r) % 10).collect()))
        .collect();
    let borrowed: Vec<(usize, usize, &[usize])> = reviews
        .iter()
        .map(|(u, p, w)| (*u, *p, w.as_slice()))
        .collect();
    let data = common::in_memory(10, 3, 4, &borrowed);
    let config = Config {
        batch_size: 3,
        max_train_epoch: 2,
        ..small_config()
    };
    let mut gen = BatchGenerator::new(&data, &config);
    let mut order: Vec<usize> = (0..data.review_size()).collect();

    for epoch in 1..=2u64 {
        gen.shuffle(&mut order);
        gen.initialize_epoch(order.clone());
        let mut seen: HashMap<(usize, usize), usize> = HashMap::new();
        let mut emitted = 0;
        let mut finishing_batches = 0;
        loop {
            let batch = gen.get_train_batch().unwrap();
            emitted += batch.len();
            for (&r, &w) in batch.review_idxs.iter().zip(&batch.word_idxs) {
                *seen.entry((r, w)).or_default() += 1;
            }
            if !batch.has_next {
                finishing_batches += 1;
                break;
            }
        }
        assert_eq!(finishing_batches, 1);
        assert_eq!(emitted as f64, data.word_count);
        assert_eq!(gen.finished_word_num(), epoch * data.word_count as u64);
        for (r, review) in data.reviews.iter().enumerate() {
            for w in &review.words {
                let expected = review.words.iter().filter(|&x| x == w).count();
                assert_eq!(seen[&(r, *w)], expected);
            }
        }
    }
}

#[test]
fn subsampled_words_are_not_counted() {
    let words: Vec<usize> = (0..200).map(|i| if i % 10 == 0 { 1 } else { 0 }).collect();
    let mut data = common::in_memory(2, 1, 1, &[(0, 0, &words)]);
    data.sub_sampling(0.05);
    let config = Config {
        batch_size: 16,
        ..small_config()
    };
    let mut gen = BatchGenerator::new(&data, &config);
    gen.initialize_epoch(vec![0]);
    let mut emitted = 0;
    let mut rare = 0;
    loop {
        let batch = gen.get_train_batch().unwrap();
        emitted += batch.len();
        rare += batch.word_idxs.iter().filter(|&&w| w == 1).count();
        if !batch.has_next {
            break;
        }
    }
    assert_eq!(gen.finished_word_num(), emitted as u64);
    assert!(emitted < 200);
    // word 1 survives with probability sqrt(0.5)
    assert!(rare > 0);
}

#[test]
fn learning_rate_only_goes_down() {
    let data = common::in_memory(5, 2, 2, &[(0, 0, &[0, 1, 2, 3, 4]), (1, 1, &[4, 3, 2])]);
    let config = Config {
        batch_size: 2,
        max_train_epoch: 3,
        learning_rate: 0.5,
        ..small_config()
    };
    let mut gen = BatchGenerator::new(&data, &config);
    let mut previous = f32::INFINITY;
    for _ in 0..config.max_train_epoch {
        gen.initialize_epoch(vec![0, 1]);
        loop {
            let batch = gen.get_train_batch().unwrap();
            assert!(batch.learning_rate <= previous);
            assert!(batch.learning_rate > 0.0);
            previous = batch.learning_rate;
            if !batch.has_next {
                break;
            }
        }
    }
    assert!(previous < 0.5 * 0.2);
    assert_eq!(gen.words_to_train(), 3.0 * 8.0 + 1.0);
}

#[test]
fn empty_reviews_are_skipped_in_training_but_not_in_testing() {
    let data = common::in_memory(3, 2, 2, &[(0, 0, &[0, 1]), (1, 1, &[]), (0, 1, &[2])]);
    let config = small_config();
    let mut gen = BatchGenerator::new(&data, &config);

    gen.initialize_epoch(vec![0, 1, 2]);
    let train = gen.get_train_batch().unwrap();
    assert_eq!(train.review_idxs, vec![0, 0, 2]);
    assert!(!train.has_next);

    gen.initialize_epoch(vec![0, 1, 2]);
    let test = gen.get_test_batch().unwrap();
    assert_eq!(test.review_idxs, vec![0, 1, 2]);
    assert_eq!(test.user_idxs, vec![0, 1, 0]);
    assert_eq!(test.word_idxs, vec![0, 0, 2]);
    assert!(test.context_word_idxs.iter().all(Vec::is_empty));
    assert!(!test.has_next);
}

#[test]
fn same_seed_same_batches() {
    let data = common::in_memory(6, 2, 3, &[(0, 0, &[0, 1, 2, 3]), (1, 2, &[4, 5, 0, 2])]);
    let config = Config {
        batch_size: 3,
        negative_sample: 2,
        seed: 42,
        ..small_config()
    };
    let run = || {
        let mut gen = BatchGenerator::new(&data, &config);
        let mut order = vec![0, 1];
        gen.shuffle(&mut order);
        gen.initialize_epoch(order);
        let mut batches = vec![];
        loop {
            let batch = gen.get_train_batch().unwrap();
            let done = !batch.has_next;
            batches.push(batch);
            if done {
                break;
            }
        }
        batches
    };
    assert_eq!(run(), run());
}

#[test]
fn a_captured_cursor_resumes_mid_review() {
    let data = common::in_memory(6, 2, 3, &[(0, 0, &[0, 1, 2, 3]), (1, 1, &[4, 5, 0, 2])]);
    let config = Config {
        batch_size: 3,
        negative_sample: 0,
        ..small_config()
    };
    let mut gen = BatchGenerator::new(&data, &config);
    gen.initialize_epoch(vec![1, 0]);
    gen.get_train_batch().unwrap();
    let saved = bincode::serialize(gen.cursor()).unwrap();
    let expected = gen.get_train_batch().unwrap();

    let mut other = BatchGenerator::new(&data, &config);
    other.set_cursor(bincode::deserialize(&saved).unwrap());
    assert_eq!(other.cursor().state, CursorState::WithinWindow);
    assert_eq!(other.cursor().word_i, 3);
    let replayed = other.get_train_batch().unwrap();
    assert_eq!(replayed.word_idxs, expected.word_idxs);
    assert_eq!(replayed.word_idxs, vec![2, 0, 1]);
    assert_eq!(replayed.review_idxs, vec![1, 0, 0]);
}
