//! Loss tracking with exponential-moving-average smoothing.
//!
//! Purely observational: nothing in the sampling loop reads these values back.

use std::time::Instant;

/// Weight of the previous EMA value in each update.
pub const EMA_WEIGHT: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct LossLogger {
    max_steps: usize,
    losses: Vec<f64>,
    ema: Option<f64>,
    start: Instant,
}

impl LossLogger {
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps,
            losses: Vec::with_capacity(max_steps),
            ema: None,
            start: Instant::now(),
        }
    }

    /// Record a loss value; emit a progress line when `display` is set.
    pub fn log(&mut self, value: f64, display: bool) {
        self.losses.push(value);
        self.ema = Some(match self.ema {
            None => value,
            Some(ema) => EMA_WEIGHT * ema + (1.0 - EMA_WEIGHT) * value,
        });

        if display {
            tracing::info!("{}", self.progress_line());
        }
    }

    pub fn losses(&self) -> &[f64] {
        &self.losses
    }

    /// Smoothed loss, `None` before the first call to [`log`](Self::log).
    pub fn ema(&self) -> Option<f64> {
        self.ema
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn elapsed_hours(&self) -> f64 {
        self.start.elapsed().as_secs_f64() / 3600.0
    }

    pub fn progress_line(&self) -> String {
        format!(
            "Steps: {}/{} \t loss (ema): {:.3} \t Time elapsed: {:.3} hr",
            self.len(),
            self.max_steps,
            self.ema.unwrap_or(f64::NAN),
            self.elapsed_hours()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_value_initializes_ema() {
        let mut logger = LossLogger::new(10);
        assert!(logger.ema().is_none());
        logger.log(2.0, false);
        assert_eq!(logger.ema(), Some(2.0));
        assert_eq!(logger.losses(), &[2.0]);
    }

    #[test]
    fn ema_update_rule() {
        let mut logger = LossLogger::new(10);
        logger.log(1.0, false);
        logger.log(0.0, false);
        logger.log(0.0, false);
        // 0.9·(0.9·1.0) = 0.81
        assert!((logger.ema().unwrap() - 0.81).abs() < 1e-12);
        assert_eq!(logger.len(), 3);
    }

    #[test]
    fn progress_line_reports_steps_and_ema() {
        let mut logger = LossLogger::new(250);
        logger.log(0.5, true);
        let line = logger.progress_line();
        assert!(line.starts_with("Steps: 1/250"), "{line}");
        assert!(line.contains("loss (ema): 0.500"), "{line}");
        assert!(line.ends_with(" hr"), "{line}");
    }
}
