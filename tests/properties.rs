use chrono::{TimeZone, Utc};
use market_report_verifier::config::{ScoringConfig, VerifierConfig};
use market_report_verifier::models::{
    Claim, ClaimStatus, ClaimUnit, Direction, InstrumentClass, Quote, ReferenceSnapshot, SourceSpan,
    VerifiedClaim,
};
use market_report_verifier::quality::{QualityScorer, ReportScorer};
use market_report_verifier::verification::ClaimVerifier;
use proptest::prelude::*;
use uuid::Uuid;

const REPORT: &str = "\
## 市场概况
苹果公司收于190美元【新闻1】。

## 投资主题
算力需求持续【新闻2】。

## 风险提示
估值偏高【新闻1】。

## 投资建议
保持均衡配置【新闻2】。
";

fn snapshot() -> ReferenceSnapshot {
    let taken_at = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
    let quote = |name: &str, price: f64, change: f64| Quote {
        name: Some(name.to_string()),
        price,
        change_percent: Some(change),
        currency: "USD".to_string(),
        as_of: taken_at,
    };
    ReferenceSnapshot::empty(taken_at)
        .with_quote(InstrumentClass::Equity, "AAPL", quote("Apple", 190.0, 1.2))
        .with_quote(InstrumentClass::Equity, "NVDA", quote("Nvidia", 480.0, -2.0))
        .with_quote(InstrumentClass::Commodity, "XAU", quote("黄金", 2050.0, 0.4))
}

fn claim(subject: &str, unit: ClaimUnit, value: f64, direction: Direction) -> Claim {
    Claim {
        id: Uuid::new_v4(),
        subject_text: subject.to_string(),
        subject_key_guess: subject.to_string(),
        asserted_value: match unit {
            ClaimUnit::None => None,
            _ => Some(value),
        },
        unit,
        direction,
        companion_percent: None,
        span: SourceSpan {
            start: 0,
            end: subject.len(),
            text: subject.to_string(),
        },
    }
}

fn arb_claim() -> impl Strategy<Value = Claim> {
    let subject = prop::sample::select(vec!["AAPL", "NVDA", "XAU", "TSLA", "MSFT"]);
    let unit = prop::sample::select(vec![ClaimUnit::Price, ClaimUnit::Percent, ClaimUnit::None]);
    let direction = prop::sample::select(vec![
        Direction::Up,
        Direction::Down,
        Direction::Flat,
        Direction::None,
    ]);
    (subject, unit, -10.0f64..3000.0, direction)
        .prop_map(|(subject, unit, value, direction)| claim(subject, unit, value, direction))
}

fn labelled(status: ClaimStatus) -> VerifiedClaim {
    VerifiedClaim {
        claim: claim("AAPL", ClaimUnit::Price, 190.0, Direction::None),
        status,
        resolved_key: Some("AAPL".to_string()),
        reference_value: Some(190.0),
        delta: None,
        relative_delta: None,
        evidence: String::new(),
    }
}

proptest! {
    #[test]
    fn verify_is_order_independent(claims in prop::collection::vec(arb_claim(), 0..12)) {
        let verifier = ClaimVerifier::default();
        let snapshot = snapshot();

        let forward = verifier.verify(&claims, &snapshot);
        let mut reversed_claims = claims.clone();
        reversed_claims.reverse();
        let mut backward = verifier.verify(&reversed_claims, &snapshot);
        backward.reverse();

        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn verify_is_idempotent(claims in prop::collection::vec(arb_claim(), 0..12)) {
        let verifier = ClaimVerifier::default();
        let snapshot = snapshot();

        prop_assert_eq!(verifier.verify(&claims, &snapshot), verifier.verify(&claims, &snapshot));
    }

    #[test]
    fn price_tolerance_band(deviation_pct in -10.0f64..10.0) {
        prop_assume!((deviation_pct.abs() - 2.0).abs() > 0.01);

        let verifier = ClaimVerifier::new(VerifierConfig::default());
        let asserted = 190.0 * (1.0 + deviation_pct / 100.0);
        let claims = vec![claim("AAPL", ClaimUnit::Price, asserted, Direction::None)];
        let verified = verifier.verify(&claims, &snapshot());

        let expected = if deviation_pct.abs() < 2.0 {
            ClaimStatus::Verified
        } else {
            ClaimStatus::Contradicted
        };
        prop_assert_eq!(verified[0].status, expected);
    }

    #[test]
    fn unknown_subjects_are_unmatched(value in 1.0f64..1000.0) {
        let verifier = ClaimVerifier::default();
        let claims = vec![claim("TSLA", ClaimUnit::Price, value, Direction::Up)];
        let verified = verifier.verify(&claims, &snapshot());

        prop_assert_eq!(verified[0].status, ClaimStatus::Unmatched);
        prop_assert!(verified[0].reference_value.is_none());
    }

    #[test]
    fn score_grows_with_verified_share(total in 1usize..12, verified_a in 0usize..12, verified_b in 0usize..12) {
        let (low, high) = (verified_a.min(verified_b).min(total), verified_a.max(verified_b).min(total));
        let scorer = QualityScorer::new(ScoringConfig::default(), 80.0).unwrap();
        let snapshot = snapshot();
        let now = snapshot.taken_at + chrono::Duration::minutes(5);

        let claims_with = |verified: usize| -> Vec<VerifiedClaim> {
            (0..total)
                .map(|i| labelled(if i < verified { ClaimStatus::Verified } else { ClaimStatus::Contradicted }))
                .collect()
        };

        let low_score = scorer.score_at(REPORT, &claims_with(low), &snapshot, now).score;
        let high_score = scorer.score_at(REPORT, &claims_with(high), &snapshot, now).score;
        prop_assert!(high_score >= low_score);
    }
}

#[test]
fn scenario_price_outside_tolerance_is_contradicted() {
    let snapshot = ReferenceSnapshot::empty(Utc::now()).with_quote(
        InstrumentClass::Equity,
        "AAPL",
        Quote {
            name: None,
            price: 190.0,
            change_percent: None,
            currency: "USD".to_string(),
            as_of: Utc::now(),
        },
    );
    let claims = vec![claim("AAPL", ClaimUnit::Price, 195.0, Direction::Up)];

    let verified = ClaimVerifier::default().verify(&claims, &snapshot);

    assert_eq!(verified[0].status, ClaimStatus::Contradicted);
    let relative = verified[0].relative_delta.unwrap();
    assert!((relative - 0.0263).abs() < 0.001);
}
