//! 充電検出ステートマシン
//!
//! アナログ値をしきい値＋ヒステリシスで分類し、候補状態で一定時間保持されたら遷移を確定する。
//!
//! ```text
//! Idle -> StartCandidate -> Charging -> EndCandidate -> Idle
//! ```
//!
//! - 開始条件: `value >= threshold + hysteresis`
//! - 終了条件: `value <= threshold - hysteresis`
//! - 中間値は候補の保持時間を進めず、リセットもしない
//! - 候補と矛盾する値を1回でも観測したら候補を破棄する
//!
//! 時刻は単調増加のミリ秒カウンタを外部から与える（実時間に依存せずテスト可能）。

use crate::config::MeterConfig;

/// 充電状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargingState {
    Idle,
    StartCandidate,
    Charging,
    EndCandidate,
}

/// サンプルの分類結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleClass {
    /// 開始条件を満たす
    Start,
    /// 終了条件を満たす
    End,
    /// ヒステリシス帯の中
    Neutral,
}

/// 確定した遷移（呼び出し側で取得処理を行い、結果を返す）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Confirmed {
    /// 開始が確定した。`complete_start` で結果を通知する
    Start,
    /// 終了が確定した。`complete_end` で結果を通知する
    End,
}

/// 検出パラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    pub threshold: u16,
    pub hysteresis: u16,
    pub start_confirm_ms: u64,
    pub end_confirm_ms: u64,
}

impl DetectorConfig {
    /// サンプルを分類
    pub fn classify(&self, value: u16) -> SampleClass {
        let value = value as i32;
        let threshold = self.threshold as i32;
        let hysteresis = self.hysteresis as i32;

        if value >= threshold + hysteresis {
            SampleClass::Start
        } else if value <= threshold - hysteresis {
            SampleClass::End
        } else {
            SampleClass::Neutral
        }
    }
}

impl From<&MeterConfig> for DetectorConfig {
    fn from(config: &MeterConfig) -> Self {
        Self {
            threshold: config.charging_threshold,
            hysteresis: config.charging_hysteresis,
            start_confirm_ms: config.start_confirm_s as u64 * 1000,
            end_confirm_ms: config.end_confirm_s as u64 * 1000,
        }
    }
}

/// 候補状態の保持時間
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    /// 候補に入った時刻
    since_ms: u64,
    /// 条件を満たす連続サンプル間で積算した保持時間
    held_ms: u64,
    /// 直前の条件成立サンプルの時刻（中間値の後は `None`）
    last_qualifying_ms: Option<u64>,
}

impl Candidate {
    fn new(now_ms: u64) -> Self {
        Self {
            since_ms: now_ms,
            held_ms: 0,
            last_qualifying_ms: Some(now_ms),
        }
    }

    fn qualify(&mut self, now_ms: u64) {
        if let Some(last) = self.last_qualifying_ms {
            self.held_ms += now_ms.saturating_sub(last);
        }
        self.last_qualifying_ms = Some(now_ms);
    }

    fn pause(&mut self) {
        self.last_qualifying_ms = None;
    }
}

/// 充電検出器
pub struct ChargingDetector {
    config: DetectorConfig,
    state: ChargingState,
    candidate: Option<Candidate>,
}

impl ChargingDetector {
    pub const fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: ChargingState::Idle,
            candidate: None,
        }
    }

    /// 永続化されたセッション状態から復元（アクティブなら `Charging` から開始）
    pub fn restore(config: DetectorConfig, active: bool) -> Self {
        let mut detector = Self::new(config);
        if active {
            detector.state = ChargingState::Charging;
        }
        detector
    }

    pub fn state(&self) -> ChargingState {
        self.state
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn is_charging(&self) -> bool {
        matches!(
            self.state,
            ChargingState::Charging | ChargingState::EndCandidate
        )
    }

    /// 候補に入ってからの経過時間 [ms]
    pub fn candidate_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.candidate.map(|c| now_ms.saturating_sub(c.since_ms))
    }

    /// サンプルを1つ処理する
    ///
    /// # Returns
    /// 遷移が確定した場合は `Some(Confirmed)`。状態は候補のまま残り、
    /// 呼び出し側が `complete_start` / `complete_end` で結果を通知するまで次の遷移は起きない。
    pub fn sample(&mut self, now_ms: u64, value: u16) -> Option<Confirmed> {
        let class = self.config.classify(value);

        match self.state {
            ChargingState::Idle => {
                if class == SampleClass::Start {
                    self.enter(ChargingState::StartCandidate, now_ms, value);
                }
                None
            }
            ChargingState::StartCandidate => {
                self.advance(now_ms, class, SampleClass::Start, ChargingState::Idle, value)
                    .then_some(Confirmed::Start)
            }
            ChargingState::Charging => {
                if class == SampleClass::End {
                    self.enter(ChargingState::EndCandidate, now_ms, value);
                }
                None
            }
            ChargingState::EndCandidate => {
                self.advance(now_ms, class, SampleClass::End, ChargingState::Charging, value)
                    .then_some(Confirmed::End)
            }
        }
    }

    /// 開始処理の結果を通知（失敗時は Idle に戻り、最初からやり直す）
    pub fn complete_start(&mut self, captured: bool) {
        if self.state != ChargingState::StartCandidate {
            return;
        }
        self.candidate = None;
        self.state = if captured {
            ChargingState::Charging
        } else {
            ChargingState::Idle
        };
        info!("Charging state -> {}", self.state);
    }

    /// 終了処理の結果を通知（失敗時は Charging に戻る）
    pub fn complete_end(&mut self, finalized: bool) {
        if self.state != ChargingState::EndCandidate {
            return;
        }
        self.candidate = None;
        self.state = if finalized {
            ChargingState::Idle
        } else {
            ChargingState::Charging
        };
        info!("Charging state -> {}", self.state);
    }

    fn enter(&mut self, state: ChargingState, now_ms: u64, value: u16) {
        debug!("Charging state -> {} (value={})", state, value);
        self.state = state;
        self.candidate = Some(Candidate::new(now_ms));
    }

    /// 候補状態を進める。保持時間が確定時間に達したら `true`
    fn advance(
        &mut self,
        now_ms: u64,
        class: SampleClass,
        qualifying: SampleClass,
        fallback: ChargingState,
        value: u16,
    ) -> bool {
        let Some(candidate) = self.candidate.as_mut() else {
            self.state = fallback;
            return false;
        };

        if class == qualifying {
            candidate.qualify(now_ms);
        } else if class == SampleClass::Neutral {
            candidate.pause();
            return false;
        } else {
            debug!("Charging candidate reset (value={})", value);
            self.candidate = None;
            self.state = fallback;
            return false;
        }

        let required_ms = match qualifying {
            SampleClass::Start => self.config.start_confirm_ms,
            _ => self.config.end_confirm_ms,
        };
        candidate.held_ms >= required_ms
    }
}
