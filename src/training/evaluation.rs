use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-class F1 for `labels`. A label with no support and no predictions
/// scores 0.
pub fn f1_per_label(truth: &[usize], predicted: &[usize], labels: &[usize]) -> Vec<f64> {
    labels
        .iter()
        .map(|&label| {
            let (tp, fp, fn_) = counts(truth, predicted, label);
            f1(tp, fp, fn_)
        })
        .collect()
}

pub fn macro_f1(truth: &[usize], predicted: &[usize], labels: &[usize]) -> f64 {
    let scores = f1_per_label(truth, predicted, labels);
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// F1 over the pooled counts of every label in `labels`.
pub fn micro_f1(truth: &[usize], predicted: &[usize], labels: &[usize]) -> f64 {
    let (tp, fp, fn_) = labels.iter().fold((0, 0, 0), |acc, &label| {
        let (tp, fp, fn_) = counts(truth, predicted, label);
        (acc.0 + tp, acc.1 + fp, acc.2 + fn_)
    });
    f1(tp, fp, fn_)
}

/// Sorted union of the labels that occur in either sequence.
pub fn present_labels(truth: &[usize], predicted: &[usize]) -> Vec<usize> {
    let mut labels: Vec<usize> = truth.iter().chain(predicted).copied().collect();
    labels.sort_unstable();
    labels.dedup();
    labels
}

fn counts(truth: &[usize], predicted: &[usize], label: usize) -> (usize, usize, usize) {
    truth
        .iter()
        .zip(predicted)
        .fold((0, 0, 0), |(tp, fp, fn_), (&t, &p)| match (t == label, p == label) {
            (true, true) => (tp + 1, fp, fn_),
            (false, true) => (tp, fp + 1, fn_),
            (true, false) => (tp, fp, fn_ + 1),
            (false, false) => (tp, fp, fn_),
        })
}

fn f1(tp: usize, fp: usize, fn_: usize) -> f64 {
    let denominator = 2 * tp + fp + fn_;
    if denominator == 0 {
        0.0
    } else {
        2.0 * tp as f64 / denominator as f64
    }
}

pub fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (index, &value)| {
            if value > best.1 {
                (index, value)
            } else {
                best
            }
        })
        .0
}

/// Gold labels and predicted distributions of one pair.
#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub source_id: String,
    pub target_id: String,
    pub link: usize,
    pub relation: usize,
    pub source_type: usize,
    pub target_type: usize,
    pub link_probs: Vec<f32>,
    pub relation_probs: Vec<f32>,
    pub source_probs: Vec<f32>,
    pub target_probs: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub link: f64,
    pub relation: Vec<(usize, f64)>,
    pub relation_macro: f64,
    pub proposition: Vec<(usize, f64)>,
    pub proposition_macro: f64,
    pub proposition_micro: f64,
    pub avg_lp: f64,
    pub avg_all: f64,
}

impl fmt::Display for Scores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg_all {:.5} | avg_lp {:.5} | link {:.5} | rel macro {:.5}",
            self.avg_all, self.avg_lp, self.link, self.relation_macro
        )?;
        for (label, score) in &self.relation {
            write!(f, " r{}={:.5}", label, score)?;
        }
        write!(f, " | prop macro {:.5}", self.proposition_macro)?;
        for (label, score) in &self.proposition {
            write!(f, " p{}={:.5}", label, score)?;
        }
        write!(f, " | prop micro {:.5}", self.proposition_micro)
    }
}

/// Scores a set of pair outcomes.
///
/// Link and relation scores ignore reflexive pairs. Proposition types are
/// scored once per proposition: the source-head distributions of every pair
/// where it is the source and the target-head distributions of every pair
/// where it is the target are summed before the argmax.
pub fn score(outcomes: &[PairOutcome], positive_relations: &[usize]) -> Scores {
    let (links_true, links_pred, rel_true, rel_pred) = outcomes
        .iter()
        .filter(|o| o.source_id != o.target_id)
        .fold(
            (Vec::new(), Vec::new(), Vec::new(), Vec::new()),
            |(mut lt, mut lp, mut rt, mut rp), o| {
                lt.push(o.link);
                lp.push(argmax(&o.link_probs));
                rt.push(o.relation);
                rp.push(argmax(&o.relation_probs));
                (lt, lp, rt, rp)
            },
        );

    // id -> (summed predicted distribution, gold label votes)
    let mut propositions: BTreeMap<&str, (Vec<f32>, Vec<f32>)> = BTreeMap::new();
    for o in outcomes {
        for (id, label, probs) in [
            (o.source_id.as_str(), o.source_type, &o.source_probs),
            (o.target_id.as_str(), o.target_type, &o.target_probs),
        ] {
            let entry = propositions.entry(id).or_insert_with(|| {
                (vec![0.0; probs.len()], vec![0.0; probs.len()])
            });
            if entry.0.len() < probs.len() {
                entry.0.resize(probs.len(), 0.0);
            }
            if entry.1.len() <= label {
                entry.1.resize(label + 1, 0.0);
            }
            for (sum, p) in entry.0.iter_mut().zip(probs) {
                *sum += p;
            }
            entry.1[label] += 1.0;
        }
    }
    let (prop_true, prop_pred): (Vec<usize>, Vec<usize>) = propositions
        .values()
        .map(|(predicted, gold)| (argmax(gold), argmax(predicted)))
        .unzip();

    let link = f1_per_label(&links_true, &links_pred, &[0])[0];
    let relation_scores = f1_per_label(&rel_true, &rel_pred, positive_relations);
    let relation_macro = macro_f1(&rel_true, &rel_pred, positive_relations);

    let labels = present_labels(&prop_true, &prop_pred);
    let proposition_scores = f1_per_label(&prop_true, &prop_pred, &labels);
    let proposition_macro = macro_f1(&prop_true, &prop_pred, &labels);
    let proposition_micro = micro_f1(&prop_true, &prop_pred, &labels);

    Scores {
        link,
        relation: positive_relations.iter().copied().zip(relation_scores).collect(),
        relation_macro,
        proposition: labels.into_iter().zip(proposition_scores).collect(),
        proposition_macro,
        proposition_micro,
        avg_lp: (link + proposition_macro) / 2.0,
        avg_all: (link + proposition_macro + relation_macro) / 3.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(source: &str, target: &str, link: usize, relation: usize, types: (usize, usize)) -> PairOutcome {
        PairOutcome {
            source_id: source.to_string(),
            target_id: target.to_string(),
            link,
            relation,
            source_type: types.0,
            target_type: types.1,
            link_probs: vec![0.0; 2],
            relation_probs: vec![0.0; 3],
            source_probs: vec![0.0; 2],
            target_probs: vec![0.0; 2],
        }
    }

    #[test]
    fn test_f1_counts() {
        let truth = [0, 0, 1, 1, 2];
        let predicted = [0, 1, 1, 1, 0];
        let scores = f1_per_label(&truth, &predicted, &[0, 1, 2]);
        assert!((scores[0] - 0.5).abs() < 1e-12);
        assert!((scores[1] - 0.8).abs() < 1e-12);
        assert_eq!(scores[2], 0.0);
        assert!((macro_f1(&truth, &predicted, &[0, 1]) - 0.65).abs() < 1e-12);
        assert!((micro_f1(&truth, &predicted, &[0, 1, 2]) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_label_without_support_scores_zero() {
        assert_eq!(f1_per_label(&[1, 1], &[1, 1], &[0]), vec![0.0]);
        assert_eq!(present_labels(&[2, 0], &[1, 0]), vec![0, 1, 2]);
    }

    #[test]
    fn test_argmax_takes_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), 1);
    }

    #[test]
    fn test_reflexive_pairs_are_ignored_for_links() {
        let mut linked = outcome("a", "b", 0, 0, (0, 1));
        linked.link_probs = vec![0.9, 0.1];
        linked.relation_probs = vec![0.8, 0.1, 0.1];
        // Wrong on the link head, but reflexive.
        let mut reflexive = outcome("a", "a", 1, 2, (0, 0));
        reflexive.link_probs = vec![0.9, 0.1];
        reflexive.relation_probs = vec![0.1, 0.1, 0.8];

        let scores = score(&[linked, reflexive], &[0]);
        assert_eq!(scores.link, 1.0);
        assert_eq!(scores.relation, vec![(0, 1.0)]);
    }

    #[test]
    fn test_propositions_aggregate_over_pairs() {
        // Proposition "a" is type 0; its source-head votes outweigh the
        // single wrong target-head vote.
        let mut first = outcome("a", "b", 1, 1, (0, 1));
        first.source_probs = vec![0.9, 0.1];
        first.target_probs = vec![0.2, 0.8];
        let mut second = outcome("a", "c", 1, 1, (0, 1));
        second.source_probs = vec![0.6, 0.4];
        second.target_probs = vec![0.3, 0.7];
        let mut third = outcome("b", "a", 1, 1, (1, 0));
        third.source_probs = vec![0.4, 0.6];
        third.target_probs = vec![0.3, 0.7];

        let scores = score(&[first, second, third], &[0]);
        assert_eq!(scores.proposition_micro, 1.0);
        assert_eq!(scores.proposition_macro, 1.0);
        assert_eq!(scores.proposition, vec![(0, 1.0), (1, 1.0)]);
        assert_eq!(scores.link, 0.0);
        assert!((scores.avg_lp - 0.5).abs() < 1e-12);
    }
}
