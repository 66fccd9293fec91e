//! Arithmetic CAPTCHA placeholder.
//!
//! Challenges are simple sums and differences of two numbers in 1..=10. This
//! is a speed bump for flagged submissions, not a real CAPTCHA.

use chrono::Duration;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::cache::ResponseCache;
use crate::core::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaChallenge {
    pub question: String,
    pub answer: i32,
}

/// A challenge handed to a client, answer withheld
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCaptcha {
    pub token: String,
    pub question: String,
    pub expires_in_seconds: i64,
}

pub fn generate_captcha() -> CaptchaChallenge {
    generate_with(&mut rand::thread_rng())
}

pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> CaptchaChallenge {
    let a: i32 = rng.gen_range(1..=10);
    let b: i32 = rng.gen_range(1..=10);
    if rng.gen_bool(0.5) {
        CaptchaChallenge {
            question: format!("What is {} + {}?", a, b),
            answer: a + b,
        }
    } else {
        CaptchaChallenge {
            question: format!("What is {} - {}?", a, b),
            answer: a - b,
        }
    }
}

/// Compare a free-text answer with the expected value
pub fn verify_captcha(user_answer: &str, expected: i32) -> bool {
    user_answer
        .trim()
        .parse::<i32>()
        .map(|parsed| parsed == expected)
        .unwrap_or(false)
}

/// Outstanding challenges keyed by single-use token
pub struct CaptchaStore {
    challenges: ResponseCache<i32>,
    ttl: Duration,
}

impl CaptchaStore {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            challenges: ResponseCache::new(capacity, ttl, clock),
            ttl,
        }
    }

    pub fn issue(&self) -> IssuedCaptcha {
        let challenge = generate_captcha();
        let token = Uuid::new_v4().to_string();
        self.challenges.set(&token, challenge.answer, Some(self.ttl));
        IssuedCaptcha {
            token,
            question: challenge.question,
            expires_in_seconds: self.ttl.num_seconds(),
        }
    }

    /// Check an answer; the token is consumed whether or not it matches
    pub fn verify(&self, token: &str, answer: &str) -> bool {
        self.challenges
            .take(token)
            .map(|expected| verify_captcha(answer, expected))
            .unwrap_or(false)
    }

    pub fn clean_expired(&self) -> usize {
        self.challenges.clean_expired()
    }
}
