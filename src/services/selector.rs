//! 自适应选题
//! 根据用户历史表现计算难度配比，从题池中按配比抽题，再按 易 -> 中 -> 难 排序

use crate::models::{
    Difficulty, DifficultyCounts, PerformanceProfile, Question, TestHistoryRecord, Trend,
};
use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;

/// 无历史时的默认平均分
const NEUTRAL_SCORE: f64 = 0.5;
/// 判定趋势所需的最少测试次数
const MIN_TESTS_FOR_TREND: usize = 3;
/// 趋势判定阈值
const TREND_THRESHOLD: f64 = 0.1;
/// 趋势调整幅度
const TREND_SHIFT: f64 = 0.1;

impl PerformanceProfile {
    /// 从测试历史（时间升序）计算画像
    pub fn from_history(records: &[TestHistoryRecord]) -> Self {
        if records.is_empty() {
            return Self {
                average_score: NEUTRAL_SCORE,
                trend: Trend::Stable,
                tests_taken: 0,
            };
        }

        let scores: Vec<f64> = records.iter().map(|r| r.score.clamp(0.0, 1.0)).collect();
        let average_score = mean(&scores);

        let trend = if scores.len() >= MIN_TESTS_FOR_TREND {
            let (older, recent) = scores.split_at(scores.len() / 2);
            let delta = mean(recent) - mean(older);
            if delta > TREND_THRESHOLD {
                Trend::Improving
            } else if delta < -TREND_THRESHOLD {
                Trend::Declining
            } else {
                Trend::Stable
            }
        } else {
            Trend::Stable
        };

        Self {
            average_score,
            trend,
            tests_taken: records.len(),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// 难度配比，三者之和为 1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifficultyMix {
    pub easy: f64,
    pub medium: f64,
    pub hard: f64,
}

impl DifficultyMix {
    pub fn for_profile(profile: &PerformanceProfile) -> Self {
        let mut mix = if profile.average_score < 0.4 {
            Self { easy: 0.5, medium: 0.4, hard: 0.1 }
        } else if profile.average_score < 0.7 {
            Self { easy: 0.3, medium: 0.5, hard: 0.2 }
        } else {
            Self { easy: 0.2, medium: 0.5, hard: 0.3 }
        };

        match profile.trend {
            Trend::Improving => {
                let shift = TREND_SHIFT.min(mix.easy);
                mix.easy -= shift;
                mix.hard += shift;
            }
            Trend::Declining => {
                let shift = TREND_SHIFT.min(mix.hard);
                mix.hard -= shift;
                mix.easy += shift;
            }
            Trend::Stable => {}
        }

        mix.normalized()
    }

    fn normalized(self) -> Self {
        let total = self.easy + self.medium + self.hard;
        if total <= 0.0 {
            return Self { easy: 0.0, medium: 1.0, hard: 0.0 };
        }
        Self {
            easy: self.easy / total,
            medium: self.medium / total,
            hard: self.hard / total,
        }
    }

    /// 换算为整数题量，余数全部计入中等难度
    pub fn targets(&self, count: usize) -> DifficultyCounts {
        let share = |p: f64| ((count as f64) * p + 1e-9).floor() as usize;
        let easy = share(self.easy).min(count);
        let hard = share(self.hard).min(count - easy);
        DifficultyCounts {
            easy,
            medium: count - easy - hard,
            hard,
        }
    }
}

/// 自适应选题器
pub struct AdaptiveSelector;

impl AdaptiveSelector {
    pub fn select(
        pool: Vec<Question>,
        profile: &PerformanceProfile,
        target_count: usize,
    ) -> Vec<Question> {
        Self::select_with_rng(pool, profile, target_count, &mut rand::thread_rng())
    }

    pub fn select_with_rng<R: Rng + ?Sized>(
        pool: Vec<Question>,
        profile: &PerformanceProfile,
        target_count: usize,
        rng: &mut R,
    ) -> Vec<Question> {
        if pool.len() <= target_count {
            // 题量不足：全部返回，不补齐也不重复
            return Self::progressive_order(pool, rng);
        }

        let mix = DifficultyMix::for_profile(profile);
        let targets = mix.targets(target_count);
        debug!(
            "[selector] score={:.2} trend={:?} targets easy={} medium={} hard={}",
            profile.average_score, profile.trend, targets.easy, targets.medium, targets.hard
        );

        let mut easy = Vec::new();
        let mut medium = Vec::new();
        let mut hard = Vec::new();
        for q in pool {
            match q.difficulty {
                Difficulty::Easy => easy.push(q),
                Difficulty::Medium => medium.push(q),
                Difficulty::Hard => hard.push(q),
            }
        }

        let mut selected = Vec::with_capacity(target_count);
        let mut remaining = Vec::new();
        for (mut bucket, want) in [
            (easy, targets.easy),
            (medium, targets.medium),
            (hard, targets.hard),
        ] {
            bucket.shuffle(rng);
            let take = want.min(bucket.len());
            remaining.extend(bucket.split_off(take));
            selected.extend(bucket);
        }

        // 某个难度不够时，用剩余题目补足
        if selected.len() < target_count {
            remaining.shuffle(rng);
            let need = target_count - selected.len();
            selected.extend(remaining.into_iter().take(need));
        }

        Self::progressive_order(selected, rng)
    }

    /// 难度内打乱，按 易 -> 中 -> 难 拼接
    fn progressive_order<R: Rng + ?Sized>(questions: Vec<Question>, rng: &mut R) -> Vec<Question> {
        let mut buckets: [Vec<Question>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for q in questions {
            let idx = match q.difficulty {
                Difficulty::Easy => 0,
                Difficulty::Medium => 1,
                Difficulty::Hard => 2,
            };
            buckets[idx].push(q);
        }
        let mut ordered = Vec::new();
        for mut bucket in buckets {
            bucket.shuffle(rng);
            ordered.extend(bucket);
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OptionKey, QuestionSource};
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::{BTreeMap, HashSet};

    fn q(id: i64, difficulty: Difficulty) -> Question {
        let mut options = BTreeMap::new();
        for key in OptionKey::ALL {
            options.insert(key, format!("choice {}", key));
        }
        Question {
            id,
            topic_id: 1,
            question_text: format!("Question {}?", id),
            options,
            correct_answer: OptionKey::A,
            explanation: String::new(),
            difficulty,
            source: QuestionSource::PreviousYear,
            rating_avg: 0.0,
            rating_count: 0,
        }
    }

    fn balanced_pool(per_bucket: i64) -> Vec<Question> {
        let mut pool = Vec::new();
        for i in 0..per_bucket {
            pool.push(q(i, Difficulty::Easy));
            pool.push(q(100 + i, Difficulty::Medium));
            pool.push(q(200 + i, Difficulty::Hard));
        }
        pool
    }

    fn profile(score: f64, trend: Trend) -> PerformanceProfile {
        PerformanceProfile {
            average_score: score,
            trend,
            tests_taken: 5,
        }
    }

    fn record(score: f64) -> TestHistoryRecord {
        TestHistoryRecord {
            id: 0,
            user_id: 1,
            topic_id: 1,
            score,
            question_ids: vec![],
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn test_base_mix_by_score() {
        let low = DifficultyMix::for_profile(&profile(0.3, Trend::Stable));
        assert!((low.easy - 0.5).abs() < 1e-9 && (low.hard - 0.1).abs() < 1e-9);

        let mid = DifficultyMix::for_profile(&profile(0.4, Trend::Stable));
        assert!((mid.medium - 0.5).abs() < 1e-9 && (mid.hard - 0.2).abs() < 1e-9);

        let high = DifficultyMix::for_profile(&profile(0.7, Trend::Stable));
        assert!((high.hard - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_trend_adjustment() {
        let stable = DifficultyMix::for_profile(&profile(0.3, Trend::Stable));
        let improving = DifficultyMix::for_profile(&profile(0.3, Trend::Improving));
        let declining = DifficultyMix::for_profile(&profile(0.3, Trend::Declining));

        assert!(improving.hard > stable.hard);
        assert!(improving.easy < stable.easy);
        assert!(declining.easy > stable.easy);
        // 难题占比 0.1 时最多只能拿走 0.1
        assert!(declining.hard.abs() < 1e-9);

        for mix in [stable, improving, declining] {
            assert!((mix.easy + mix.medium + mix.hard - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_targets_sum_exactly() {
        let mix = DifficultyMix::for_profile(&profile(0.5, Trend::Improving));
        for count in [0, 1, 3, 7, 10, 13, 50] {
            assert_eq!(mix.targets(count).total(), count);
        }
        let targets = DifficultyMix::for_profile(&profile(0.3, Trend::Stable)).targets(7);
        // 7 * 0.5 = 3.5 -> 3, 7 * 0.1 = 0.7 -> 0, 余数进中等
        assert_eq!((targets.easy, targets.medium, targets.hard), (3, 4, 0));
    }

    #[test]
    fn test_beginner_bias() {
        let mut rng = StdRng::seed_from_u64(7);
        let selected = AdaptiveSelector::select_with_rng(
            balanced_pool(20),
            &profile(0.3, Trend::Stable),
            10,
            &mut rng,
        );
        let counts = DifficultyCounts::from_questions(&selected);
        assert_eq!(selected.len(), 10);
        assert!(counts.easy >= counts.hard);
        assert_eq!((counts.easy, counts.medium, counts.hard), (5, 4, 1));
    }

    #[test]
    fn test_improving_trend_raises_hard_share() {
        let mut rng = StdRng::seed_from_u64(11);
        let stable = AdaptiveSelector::select_with_rng(
            balanced_pool(20),
            &profile(0.3, Trend::Stable),
            10,
            &mut rng,
        );
        let improving = AdaptiveSelector::select_with_rng(
            balanced_pool(20),
            &profile(0.3, Trend::Improving),
            10,
            &mut rng,
        );
        let hard = |qs: &[Question]| qs.iter().filter(|q| q.difficulty == Difficulty::Hard).count();
        assert!(hard(&improving) > hard(&stable));
    }

    #[test]
    fn test_backfills_missing_bucket() {
        let pool: Vec<Question> = (0..10).map(|i| q(i, Difficulty::Medium)).collect();
        let selected = AdaptiveSelector::select(pool, &profile(0.3, Trend::Stable), 6);
        assert_eq!(selected.len(), 6);
        let ids: HashSet<i64> = selected.iter().map(|q| q.id).collect();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_small_pool_returns_everything_in_order() {
        let pool = vec![q(1, Difficulty::Hard), q(2, Difficulty::Easy), q(3, Difficulty::Medium)];
        let selected = AdaptiveSelector::select(pool, &profile(0.8, Trend::Stable), 10);
        let order: Vec<Difficulty> = selected.iter().map(|q| q.difficulty).collect();
        assert_eq!(order, vec![Difficulty::Easy, Difficulty::Medium, Difficulty::Hard]);
    }

    #[test]
    fn test_output_is_monotonic() {
        let selected =
            AdaptiveSelector::select(balanced_pool(10), &profile(0.6, Trend::Declining), 12);
        let ranks: Vec<Difficulty> = selected.iter().map(|q| q.difficulty).collect();
        let mut sorted = ranks.clone();
        sorted.sort();
        assert_eq!(ranks, sorted);
    }

    #[test]
    fn test_profile_from_history() {
        let empty = PerformanceProfile::from_history(&[]);
        assert_eq!(empty.tests_taken, 0);
        assert_eq!(empty.trend, Trend::Stable);

        let improving =
            PerformanceProfile::from_history(&[record(0.2), record(0.3), record(0.6), record(0.7)]);
        assert_eq!(improving.trend, Trend::Improving);
        assert!((improving.average_score - 0.45).abs() < 1e-9);

        let declining = PerformanceProfile::from_history(&[record(0.9), record(0.5), record(0.4)]);
        assert_eq!(declining.trend, Trend::Declining);

        let short = PerformanceProfile::from_history(&[record(0.1), record(0.9)]);
        assert_eq!(short.trend, Trend::Stable);
    }
}
