//! Vote tally — redeem a token and count its vote as one commit.
//!
//! The token is claimed with a conditional update that only matches an
//! unredeemed, unexpired token whose cycle has the target option open for
//! voting. The counter is then bumped in SQL (`vote_count + 1`) on the same
//! transaction. A racing redemption of the same token waits on the write
//! lock and then matches no row; a crash before commit leaves neither change.

use serde::Serialize;
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::{debug, info};

use crate::errors::{RedemptionError, Result};
use crate::models::{OptionStatus, VoteToken};

#[derive(Debug, Clone, Serialize)]
pub struct Redemption {
    pub option_id: i64,
    pub cycle_key: String,
    /// Option's tally including this vote.
    pub vote_count: i64,
    pub redeemed_at: i64,
}

/// Spend `token` on `option_id`. Votes cannot be retracted.
pub async fn increment_and_redeem(
    pool: &SqlitePool,
    token: &str,
    option_id: i64,
    now: i64,
) -> Result<Redemption> {
    let mut tx = pool.begin().await?;

    // Write first: this takes the database write lock before anything is read.
    let claimed: Option<(String,)> = sqlx::query_as(
        r#"
        UPDATE vote_tokens
        SET    redeemed_option_id = ?2, redeemed_at = ?3
        WHERE  token = ?1
          AND  redeemed_at IS NULL
          AND  expires_at > ?3
          AND  EXISTS (
                 SELECT 1 FROM voting_options o
                 WHERE  o.id = ?2
                   AND  o.status = 'voting'
                   AND  o.cycle_key = vote_tokens.cycle_key)
        RETURNING cycle_key
        "#,
    )
    .bind(token)
    .bind(option_id)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((cycle_key,)) = claimed else {
        let reason = diagnose(&mut tx, token, option_id, now).await?;
        debug!(option = option_id, "Redemption refused: {reason}");
        return Err(reason.into());
    };

    let counted: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE voting_options
        SET    vote_count = vote_count + 1
        WHERE  id = ?1 AND status = 'voting' AND cycle_key = ?2
        RETURNING vote_count
        "#,
    )
    .bind(option_id)
    .bind(&cycle_key)
    .fetch_optional(&mut *tx)
    .await?;

    // Dropping the transaction rolls the token claim back.
    let Some((vote_count,)) = counted else {
        return Err(RedemptionError::OptionNotVoting.into());
    };

    tx.commit().await?;
    info!(option = option_id, cycle = %cycle_key, vote_count, "Vote counted");

    Ok(Redemption {
        option_id,
        cycle_key,
        vote_count,
        redeemed_at: now,
    })
}

/// Work out which guard rejected a redemption. Already-redeemed takes
/// precedence over expiry so a voter who used their link learns that.
async fn diagnose(
    conn: &mut SqliteConnection,
    token: &str,
    option_id: i64,
    now: i64,
) -> Result<RedemptionError> {
    let found = sqlx::query_as::<_, VoteToken>(
        r#"
        SELECT token, email, cycle_key, expires_at, redeemed_option_id, redeemed_at, created_at
        FROM   vote_tokens
        WHERE  token = ?1
        "#,
    )
    .bind(token)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(found) = found else {
        return Ok(RedemptionError::NotFound);
    };
    if found.is_redeemed() {
        return Ok(RedemptionError::AlreadyRedeemed);
    }
    if found.is_expired(now) {
        return Ok(RedemptionError::Expired);
    }

    let option: Option<(OptionStatus, Option<String>)> =
        sqlx::query_as("SELECT status, cycle_key FROM voting_options WHERE id = ?1")
            .bind(option_id)
            .fetch_optional(&mut *conn)
            .await?;
    match option {
        Some((OptionStatus::Voting, Some(cycle))) if cycle == found.cycle_key => {
            // All guards pass now, so a concurrent redemption must have won.
            Ok(RedemptionError::AlreadyRedeemed)
        }
        _ => Ok(RedemptionError::OptionNotVoting),
    }
}

/// Number of tokens whose redemption names `option_id`.
pub async fn redemptions_for_option(
    executor: impl SqliteExecutor<'_>,
    option_id: i64,
) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM vote_tokens WHERE redeemed_option_id = ?1")
            .bind(option_id)
            .fetch_one(executor)
            .await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CycleKey;
    use crate::db::{file_pool, test_pool};
    use crate::errors::LedgerError;
    use crate::projects::get_option;
    use crate::projects::tests::voting_option;
    use crate::tokens::issue_token;

    fn cycle() -> CycleKey {
        CycleKey::new(2024, 5).unwrap()
    }

    fn during() -> i64 {
        cycle().starts_at() + 3_600
    }

    fn redemption_err(result: Result<Redemption>) -> RedemptionError {
        match result {
            Err(LedgerError::Redemption(e)) => e,
            other => panic!("expected redemption error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn redeem_counts_exactly_one_vote() {
        let pool = test_pool().await;
        let option = voting_option(&pool, "A", None, &cycle(), 1).await;
        let token = issue_token(&pool, "a@x.org", &cycle(), during()).await.unwrap();

        let r = increment_and_redeem(&pool, &token.token, option.id, during())
            .await
            .unwrap();
        assert_eq!(r.vote_count, 1);

        let again = increment_and_redeem(&pool, &token.token, option.id, during()).await;
        assert_eq!(redemption_err(again), RedemptionError::AlreadyRedeemed);

        let option = get_option(&pool, option.id).await.unwrap().unwrap();
        assert_eq!(option.vote_count, 1);
    }

    #[tokio::test]
    async fn specific_refusals() {
        let pool = test_pool().await;
        let open = voting_option(&pool, "Open", None, &cycle(), 1).await;
        let next_month = voting_option(&pool, "Later", None, &cycle().next(), 2).await;
        let token = issue_token(&pool, "a@x.org", &cycle(), during()).await.unwrap();

        let r = increment_and_redeem(&pool, "no-such-token", open.id, during()).await;
        assert_eq!(redemption_err(r), RedemptionError::NotFound);

        let r = increment_and_redeem(&pool, &token.token, next_month.id, during()).await;
        assert_eq!(redemption_err(r), RedemptionError::OptionNotVoting);

        let r = increment_and_redeem(&pool, &token.token, 9_999, during()).await;
        assert_eq!(redemption_err(r), RedemptionError::OptionNotVoting);

        let r = increment_and_redeem(&pool, &token.token, open.id, cycle().ends_at()).await;
        assert_eq!(redemption_err(r), RedemptionError::Expired);

        // none of the refusals consumed the token
        increment_and_redeem(&pool, &token.token, open.id, during())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redemptions_of_one_token() {
        let (pool, _dir) = file_pool().await;
        let a = voting_option(&pool, "A", None, &cycle(), 1).await;
        let b = voting_option(&pool, "B", None, &cycle(), 2).await;
        let token = issue_token(&pool, "a@x.org", &cycle(), during()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..32 {
            let pool = pool.clone();
            let token = token.token.clone();
            let target = if i % 2 == 0 { a.id } else { b.id };
            handles.push(tokio::spawn(async move {
                increment_and_redeem(&pool, &token, target, during()).await
            }));
        }

        let mut successes = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => successes += 1,
                Err(e) => assert!(matches!(
                    e,
                    LedgerError::Redemption(RedemptionError::AlreadyRedeemed)
                )),
            }
        }
        assert_eq!(successes, 1);

        let a = get_option(&pool, a.id).await.unwrap().unwrap();
        let b = get_option(&pool, b.id).await.unwrap().unwrap();
        assert_eq!(a.vote_count + b.vote_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tally_matches_redemption_records() {
        let (pool, _dir) = file_pool().await;
        let a = voting_option(&pool, "A", None, &cycle(), 1).await;
        let b = voting_option(&pool, "B", None, &cycle(), 2).await;

        let mut handles = Vec::new();
        for i in 0..60 {
            let pool = pool.clone();
            let target = if i % 3 == 0 { b.id } else { a.id };
            handles.push(tokio::spawn(async move {
                let email = format!("donor{i}@x.org");
                let token = issue_token(&pool, &email, &cycle(), during()).await.unwrap();
                increment_and_redeem(&pool, &token.token, target, during())
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for (id, expected) in [(a.id, 40), (b.id, 20)] {
            let option = get_option(&pool, id).await.unwrap().unwrap();
            assert_eq!(option.vote_count, expected);
            assert_eq!(redemptions_for_option(&pool, id).await.unwrap(), expected);
        }
    }
}
