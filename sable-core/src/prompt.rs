//! Prompt expansion and seed handling: weighted sub-prompts, the `|`
//! combination matrix, `@`-prefixed bracket-group expansion, negative-prompt
//! splitting, seed derivation, and noise-variant interpolation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A seed as supplied by the user: numeric, or an arbitrary string that is
/// folded into a deterministic 32-bit value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seed {
    Number(i64),
    Text(String),
}

fn fold_to_u32(mut n: u64) -> u32 {
    while n > u32::MAX as u64 {
        n >>= 32;
    }
    n as u32
}

/// Resolve a seed specification to a concrete 32-bit seed. Absent or empty
/// seeds are randomized; digit strings are parsed; any other string maps to
/// the same seed on every call.
pub fn seed_to_int(seed: Option<&Seed>) -> u32 {
    match seed {
        None => rand::thread_rng().gen(),
        Some(Seed::Number(n)) => fold_to_u32(n.unsigned_abs()),
        Some(Seed::Text(s)) if s.is_empty() => rand::thread_rng().gen(),
        Some(Seed::Text(s)) => match s.parse::<u64>() {
            Ok(n) => fold_to_u32(n),
            Err(_) => {
                let mut hasher = DefaultHasher::new();
                s.hash(&mut hasher);
                StdRng::seed_from_u64(hasher.finish()).gen()
            }
        },
    }
}

/// Split off the negative prompt at the first `###` delimiter.
pub fn split_negative(prompt: &str) -> (String, String) {
    match prompt.split_once("###") {
        Some((positive, negative)) => (positive.trim().to_string(), negative.trim().to_string()),
        None => (prompt.to_string(), String::new()),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WeightedSubprompt {
    pub text: String,
    pub weight: f64,
}

/// Split a prompt into `text:weight` segments. Missing weights default to
/// 1.0; with `normalize` the weights are rescaled to sum to 1.
pub fn split_weighted_subprompts(input: &str, normalize: bool) -> Vec<WeightedSubprompt> {
    let parser = Regex::new(r"(?P<prompt>[^:]+)(?::+(?P<weight>-?\d+(?:\.\d+)?)?\s*|$)")
        .expect("valid subprompt grammar");
    let mut parsed: Vec<WeightedSubprompt> = parser
        .captures_iter(input)
        .map(|cap| WeightedSubprompt {
            text: cap["prompt"].to_string(),
            weight: cap
                .name("weight")
                .and_then(|w| w.as_str().parse::<f64>().ok())
                .unwrap_or(1.0),
        })
        .collect();
    if !normalize {
        return parsed;
    }
    let weight_sum: f64 = parsed.iter().map(|p| p.weight).sum();
    if weight_sum != 0.0 {
        for p in &mut parsed {
            p.weight /= weight_sum;
        }
    }
    parsed
}

/// Expand a `|`-delimited prompt into every combination of its optional
/// clauses: the first segment is always present, each further segment is
/// toggled, giving `2^(n-1)` prompts. Returns the prompts and the raw
/// segments (for grid labeling).
pub fn prompt_matrix(prompt: &str) -> (Vec<String>, Vec<String>) {
    let parts: Vec<String> = prompt.split('|').map(str::to_string).collect();
    let combination_count = 1usize << (parts.len() - 1);
    let mut all_prompts = Vec::with_capacity(combination_count);
    for combination in 0..combination_count {
        let mut current = parts[0].clone();
        for (n, text) in parts[1..].iter().enumerate() {
            if combination & (1 << n) != 0 {
                if !text.trim_start().starts_with(',') {
                    current.push_str(", ");
                }
                current.push_str(text);
            }
        }
        all_prompts.push(current);
    }
    (all_prompts, parts)
}

#[derive(Clone, Debug)]
pub struct OxlamonExpansion {
    pub prompts: Vec<String>,
    pub seeds: Vec<u32>,
    /// One caption per prompt: the seed plus the bracket choices it used.
    pub parts: Vec<String>,
    pub n_iter: usize,
    pub needrows: Option<usize>,
}

fn collapse_commas(text: &str) -> String {
    let pattern = Regex::new(r"(,\s){2,}").expect("valid comma run pattern");
    pattern.replace_all(text, ", ").into_owned()
}

fn first_group(text: &str) -> Option<(usize, usize)> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    Some((open, close))
}

#[derive(Clone)]
struct OxlamonItem {
    text: String,
    parts: Vec<String>,
}

/// Expand an `@`-prefixed prompt where every `(a|b|c)` group multiplies out
/// independently. Seeds increment per iteration of each combination.
pub fn oxlamon_matrix(
    prompt: &str,
    seed: u32,
    n_iter: usize,
    batch_size: usize,
) -> OxlamonExpansion {
    let stripped = prompt.strip_prefix('@').unwrap_or(prompt).trim().to_string();
    let needrows = first_group(&stripped).map(|(open, close)| {
        stripped[open + 1..close].split('|').count()
    });

    let mut items = vec![OxlamonItem { text: stripped, parts: Vec::new() }];
    loop {
        let mut expanded = Vec::new();
        for item in &items {
            if let Some((open, close)) = first_group(&item.text) {
                for choice in item.text[open + 1..close].split('|') {
                    let choice = choice.trim();
                    let text = collapse_commas(&format!(
                        "{}{}{}",
                        &item.text[..open],
                        choice,
                        &item.text[close + 1..]
                    ));
                    let mut parts = item.parts.clone();
                    parts.push(choice.to_string());
                    expanded.push(OxlamonItem { text, parts });
                }
            }
        }
        if expanded.is_empty() {
            break;
        }
        items = expanded;
    }

    let mut prompts = Vec::new();
    let mut seeds = Vec::new();
    let mut parts = Vec::new();
    for item in &items {
        let mut item_seed = seed;
        for _ in 0..n_iter.max(1) {
            prompts.push(item.text.clone());
            parts.push(format!("Seed: {item_seed}\n{}", item.parts.join("\n")));
            seeds.push(item_seed);
            item_seed = item_seed.wrapping_add(1);
        }
    }
    let total = prompts.len();
    let n_iter = total.div_ceil(batch_size.max(1));

    let needrows = needrows.map(|rows| {
        let xrows = (total as f64).sqrt().round().max(1.0) as usize;
        let cols = total.div_ceil(xrows);
        if cols > rows * 4 { rows * 2 } else { rows }
    });

    OxlamonExpansion { prompts, seeds, parts, n_iter, needrows }
}

const SLERP_DOT_THRESHOLD: f64 = 0.9995;

/// Spherical interpolation between two noise tensors. Near-parallel inputs
/// fall back to linear interpolation, where the spherical formula loses
/// precision.
pub fn slerp(t: f64, v0: &Tensor, v1: &Tensor) -> Result<Tensor> {
    let a = v0.flatten_all()?.to_vec1::<f32>()?;
    let b = v1.flatten_all()?.to_vec1::<f32>()?;
    let norm_a = a.iter().map(|&v| (v as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|&v| (v as f64).powi(2)).sum::<f64>().sqrt();
    let mut dot = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum::<f64>();
    if norm_a > 0.0 && norm_b > 0.0 {
        dot /= norm_a * norm_b;
    }

    let out: Vec<f32> = if dot.abs() > SLERP_DOT_THRESHOLD {
        a.iter()
            .zip(b.iter())
            .map(|(&x, &y)| ((1.0 - t) * x as f64 + t * y as f64) as f32)
            .collect()
    } else {
        let theta_0 = dot.acos();
        let sin_theta_0 = theta_0.sin();
        let theta_t = theta_0 * t;
        let s0 = (theta_0 - theta_t).sin() / sin_theta_0;
        let s1 = theta_t.sin() / sin_theta_0;
        a.iter()
            .zip(b.iter())
            .map(|(&x, &y)| (s0 * x as f64 + s1 * y as f64) as f32)
            .collect()
    };
    Ok(Tensor::from_vec(out, v0.shape(), v0.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn seed_passthrough_and_ranges() {
        assert_eq!(seed_to_int(Some(&Seed::Number(42))), 42);
        assert_eq!(seed_to_int(Some(&Seed::Text("123".into()))), 123);
        // folds rather than truncates
        assert_eq!(seed_to_int(Some(&Seed::Number((1i64 << 32) + 7))), 7);
        let _random: u32 = seed_to_int(None);
    }

    #[test]
    fn string_seeds_are_deterministic() {
        let a = seed_to_int(Some(&Seed::Text("abc".into())));
        let b = seed_to_int(Some(&Seed::Text("abc".into())));
        assert_eq!(a, b);
        assert_ne!(a, seed_to_int(Some(&Seed::Text("abd".into()))));
    }

    #[test]
    fn negative_prompt_splits_once() {
        let (pos, neg) = split_negative("a castle ### blurry, low quality");
        assert_eq!(pos, "a castle");
        assert_eq!(neg, "blurry, low quality");
        let (pos, neg) = split_negative("no negative");
        assert_eq!(pos, "no negative");
        assert_eq!(neg, "");
    }

    #[test]
    fn weighted_subprompts_normalize() {
        let parsed = split_weighted_subprompts("a:2,b:1", true);
        assert_eq!(parsed.len(), 2);
        let sum: f64 = parsed.iter().map(|p| p.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((parsed[0].weight / parsed[1].weight - 2.0).abs() < 1e-9);
        assert!(parsed[0].text.contains('a'));
        assert!(parsed[1].text.contains('b'));
    }

    #[test]
    fn weighted_subprompts_default_weight() {
        let parsed = split_weighted_subprompts("plain prompt", false);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].weight, 1.0);
        assert_eq!(parsed[0].text, "plain prompt");
    }

    #[test]
    fn prompt_matrix_combination_count() {
        let (prompts, parts) = prompt_matrix("a|b|c");
        assert_eq!(parts.len(), 3);
        assert_eq!(prompts.len(), 4);
        assert!(prompts.iter().all(|p| p.starts_with('a')));
        assert!(prompts.contains(&"a".to_string()));
        assert!(prompts.contains(&"a, b, c".to_string()));
    }

    #[test]
    fn oxlamon_expands_bracket_groups() {
        let expansion = oxlamon_matrix("@a (x|y) b", 10, 1, 1);
        assert_eq!(expansion.prompts, vec!["a x b", "a y b"]);
        assert_eq!(expansion.seeds, vec![10, 10]);
        assert_eq!(expansion.needrows, Some(2));
    }

    #[test]
    fn oxlamon_seed_increments_per_iteration() {
        let expansion = oxlamon_matrix("@a (x|y)", 5, 2, 2);
        assert_eq!(expansion.prompts.len(), 4);
        assert_eq!(expansion.seeds, vec![5, 6, 5, 6]);
        assert_eq!(expansion.n_iter, 2);
    }

    #[test]
    fn oxlamon_cartesian_product() {
        let expansion = oxlamon_matrix("@(a|b) and (x|y)", 0, 1, 1);
        assert_eq!(expansion.prompts.len(), 4);
        assert!(expansion.prompts.contains(&"a and x".to_string()));
        assert!(expansion.prompts.contains(&"b and y".to_string()));
    }

    #[test]
    fn slerp_endpoints() {
        let device = Device::Cpu;
        let v0 = Tensor::from_vec(vec![1f32, 0.0, 0.0, 0.0], (4,), &device).unwrap();
        let v1 = Tensor::from_vec(vec![0f32, 1.0, 0.0, 0.0], (4,), &device).unwrap();
        let at0 = slerp(0.0, &v0, &v1).unwrap().to_vec1::<f32>().unwrap();
        let at1 = slerp(1.0, &v0, &v1).unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in at0.iter().zip([1f32, 0.0, 0.0, 0.0]) {
            assert!((a - b).abs() < 1e-6);
        }
        for (a, b) in at1.iter().zip([0f32, 1.0, 0.0, 0.0]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn slerp_near_parallel_matches_lerp() {
        let device = Device::Cpu;
        let v0 = Tensor::from_vec(vec![1f32, 0.001, 0.0], (3,), &device).unwrap();
        let v1 = Tensor::from_vec(vec![1f32, -0.001, 0.0], (3,), &device).unwrap();
        let mid = slerp(0.5, &v0, &v1).unwrap().to_vec1::<f32>().unwrap();
        // dot is ~1, so the result must be the plain average
        assert!((mid[0] - 1.0).abs() < 1e-6);
        assert!(mid[1].abs() < 1e-6);
    }
}
