//! Centering gate: turns per-frame face boxes into a single capture trigger.
//!
//! A face must stay inside the central tolerance band for the whole hold
//! period before the gate fires. Leaving the band at any point resets the
//! countdown to its full length. Once fired, the gate stays in
//! [`CenteringState::Captured`] until [`CenteringGate::rearm`] is called.

use crate::types::FaceBox;
use std::time::{Duration, Instant};

pub const DEFAULT_HOLD: Duration = Duration::from_secs(3);
pub const DEFAULT_TOLERANCE: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CenteringState {
    NotDetected,
    Pending { started_at: Instant },
    Captured,
}

/// What the caller should do after feeding one observation to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSignal {
    /// Nothing changed.
    Idle,
    /// A centered face appeared; the countdown starts at `remaining` seconds.
    Started { remaining: u32 },
    /// The countdown moved to a new whole second.
    Countdown { remaining: u32 },
    /// The face left the band before the countdown elapsed.
    Cancelled,
    /// Countdown elapsed: capture now. Fires once per arming.
    Capture,
}

/// True when the box center lies strictly within `tolerance` of the half
/// extents from the frame center, on both axes.
pub fn is_centered(face: &FaceBox, frame_width: u32, frame_height: u32, tolerance: f32) -> bool {
    let half_w = frame_width as f32 / 2.0;
    let half_h = frame_height as f32 / 2.0;
    let (cx, cy) = face.center();
    (cx - half_w).abs() < tolerance * half_w && (cy - half_h).abs() < tolerance * half_h
}

#[derive(Debug, Clone)]
pub struct CenteringGate {
    state: CenteringState,
    hold: Duration,
    tolerance: f32,
    last_remaining: u32,
}

impl Default for CenteringGate {
    fn default() -> Self {
        Self::new(DEFAULT_HOLD, DEFAULT_TOLERANCE)
    }
}

impl CenteringGate {
    pub fn new(hold: Duration, tolerance: f32) -> Self {
        Self {
            state: CenteringState::NotDetected,
            hold,
            tolerance,
            last_remaining: 0,
        }
    }

    pub fn state(&self) -> CenteringState {
        self.state
    }

    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Return to `NotDetected` so scanning can resume after a failed or
    /// rejected capture.
    pub fn rearm(&mut self) {
        self.state = CenteringState::NotDetected;
        self.last_remaining = 0;
    }

    /// Feed the first detected face of a frame (if any).
    pub fn observe(
        &mut self,
        now: Instant,
        face: Option<&FaceBox>,
        frame_width: u32,
        frame_height: u32,
    ) -> GateSignal {
        let centered = face.is_some_and(|f| is_centered(f, frame_width, frame_height, self.tolerance));

        match self.state {
            CenteringState::Captured => GateSignal::Idle,
            CenteringState::NotDetected if !centered => GateSignal::Idle,
            CenteringState::NotDetected => {
                self.state = CenteringState::Pending { started_at: now };
                if self.hold.is_zero() {
                    self.state = CenteringState::Captured;
                    return GateSignal::Capture;
                }
                self.last_remaining = self.remaining_secs(Duration::ZERO);
                GateSignal::Started {
                    remaining: self.last_remaining,
                }
            }
            CenteringState::Pending { .. } if !centered => {
                self.rearm();
                GateSignal::Cancelled
            }
            CenteringState::Pending { started_at } => {
                let elapsed = now.saturating_duration_since(started_at);
                if elapsed >= self.hold {
                    self.state = CenteringState::Captured;
                    return GateSignal::Capture;
                }
                let remaining = self.remaining_secs(elapsed);
                if remaining != self.last_remaining {
                    self.last_remaining = remaining;
                    GateSignal::Countdown { remaining }
                } else {
                    GateSignal::Idle
                }
            }
        }
    }

    /// Whole seconds left on the countdown, rounded up.
    fn remaining_secs(&self, elapsed: Duration) -> u32 {
        let left = self.hold.saturating_sub(elapsed);
        let millis = left.as_millis();
        millis.div_ceil(1000) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 640;
    const H: u32 = 480;

    fn face_at(cx: f32, cy: f32) -> FaceBox {
        FaceBox {
            x: cx - 50.0, y: cy - 50.0, width: 100.0, height: 100.0,
            confidence: 0.9, landmarks: None,
        }
    }

    fn centered() -> FaceBox {
        face_at(320.0, 240.0)
    }

    fn off_center() -> FaceBox {
        face_at(60.0, 60.0)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Feed a centered face every 30 ms from `from` to `to` and count captures.
    fn hold_centered(gate: &mut CenteringGate, t0: Instant, from: u64, to: u64) -> usize {
        let face = centered();
        (from..=to)
            .step_by(30)
            .filter(|&t| gate.observe(t0 + ms(t), Some(&face), W, H) == GateSignal::Capture)
            .count()
    }

    #[test]
    fn test_centering_band() {
        // Band is 20% of the half extents: |dx| < 64, |dy| < 48.
        assert!(is_centered(&face_at(320.0, 240.0), W, H, 0.2));
        assert!(is_centered(&face_at(383.0, 287.0), W, H, 0.2));
        assert!(!is_centered(&face_at(384.0, 240.0), W, H, 0.2));
        assert!(!is_centered(&face_at(320.0, 288.0), W, H, 0.2));
        assert!(!is_centered(&face_at(256.0, 240.0), W, H, 0.2));
    }

    #[test]
    fn test_no_centered_face_never_leaves_not_detected() {
        let mut gate = CenteringGate::default();
        let t0 = Instant::now();
        let off = off_center();
        for i in 0..500u64 {
            let face = if i % 2 == 0 { Some(&off) } else { None };
            assert_eq!(gate.observe(t0 + ms(i * 30), face, W, H), GateSignal::Idle);
            assert_eq!(gate.state(), CenteringState::NotDetected);
        }
    }

    #[test]
    fn test_fires_exactly_once_after_hold() {
        let mut gate = CenteringGate::default();
        let t0 = Instant::now();
        assert_eq!(hold_centered(&mut gate, t0, 0, 2_970), 0);
        assert_eq!(hold_centered(&mut gate, t0, 3_000, 10_000), 1);
        assert_eq!(gate.state(), CenteringState::Captured);
    }

    #[test]
    fn test_start_and_countdown_signals() {
        let mut gate = CenteringGate::default();
        let t0 = Instant::now();
        let face = centered();
        assert_eq!(gate.observe(t0, Some(&face), W, H), GateSignal::Started { remaining: 3 });
        assert_eq!(gate.observe(t0 + ms(500), Some(&face), W, H), GateSignal::Idle);
        assert_eq!(gate.observe(t0 + ms(1_000), Some(&face), W, H), GateSignal::Countdown { remaining: 2 });
        assert_eq!(gate.observe(t0 + ms(2_100), Some(&face), W, H), GateSignal::Countdown { remaining: 1 });
        assert_eq!(gate.observe(t0 + ms(3_000), Some(&face), W, H), GateSignal::Capture);
    }

    #[test]
    fn test_loss_at_2_9s_restarts_full_countdown() {
        let mut gate = CenteringGate::default();
        let t0 = Instant::now();
        assert_eq!(hold_centered(&mut gate, t0, 0, 2_900), 0);
        assert_eq!(gate.observe(t0 + ms(2_930), None, W, H), GateSignal::Cancelled);
        assert_eq!(gate.state(), CenteringState::NotDetected);

        // Regained at 2.96s: nothing fires until 2.96 + 3.0s.
        let face = centered();
        assert_eq!(
            gate.observe(t0 + ms(2_960), Some(&face), W, H),
            GateSignal::Started { remaining: 3 }
        );
        assert_eq!(hold_centered(&mut gate, t0, 2_990, 5_930), 0);
        assert_eq!(gate.observe(t0 + ms(5_960), Some(&face), W, H), GateSignal::Capture);
    }

    #[test]
    fn test_off_center_cancels_pending() {
        let mut gate = CenteringGate::default();
        let t0 = Instant::now();
        let face = centered();
        let off = off_center();
        gate.observe(t0, Some(&face), W, H);
        assert_eq!(gate.observe(t0 + ms(100), Some(&off), W, H), GateSignal::Cancelled);
    }

    #[test]
    fn test_rearm_allows_second_capture() {
        let mut gate = CenteringGate::default();
        let t0 = Instant::now();
        assert_eq!(hold_centered(&mut gate, t0, 0, 3_000), 1);
        assert_eq!(hold_centered(&mut gate, t0, 3_030, 9_000), 0);

        gate.rearm();
        assert_eq!(gate.state(), CenteringState::NotDetected);
        assert_eq!(hold_centered(&mut gate, t0, 10_000, 13_000), 1);
    }

    #[test]
    fn test_zero_hold_captures_immediately() {
        let mut gate = CenteringGate::new(Duration::ZERO, DEFAULT_TOLERANCE);
        let face = centered();
        assert_eq!(gate.observe(Instant::now(), Some(&face), W, H), GateSignal::Capture);
        assert_eq!(gate.state(), CenteringState::Captured);
    }
}
