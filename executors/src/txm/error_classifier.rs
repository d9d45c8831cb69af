use std::collections::BTreeMap;

use txm_core::{
    chain::NodeSendResult,
    error::RpcErrorKind,
    transaction::{FatalReason, SendOutcome},
};

/// What one node's answer to a raw transaction means for the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendErrorClass {
    /// The nonce was already used on chain
    NonceTooLow,
    /// The node already holds this exact transaction
    AlreadyKnown,
    /// Fee too low, either for the pool or to replace what the pool holds
    Underpriced,
    InsufficientFunds,
    /// The payload itself was rejected and will never be accepted
    Malformed,
    /// Gap in front of this nonce, usually resolves once earlier attempts land
    NonceTooHigh,
    /// Network trouble or an answer we do not recognise
    Transient,
}

/// Maps a node error to a [`SendErrorClass`].
///
/// Only JSON-RPC error responses are inspected; anything that never reached a node or
/// could not be read back is transient.
pub fn classify_send_error(error: &RpcErrorKind) -> SendErrorClass {
    let RpcErrorKind::ErrorResp(resp) = error else {
        return SendErrorClass::Transient;
    };

    let msg = resp.message.to_lowercase();

    if msg.contains("nonce too low") {
        SendErrorClass::NonceTooLow
    } else if msg.contains("nonce too high") {
        SendErrorClass::NonceTooHigh
    } else if msg.contains("already known")
        || msg.contains("known transaction")
        || msg.contains("alreadyknown")
        || msg.contains("duplicate")
    {
        SendErrorClass::AlreadyKnown
    } else if msg.contains("underpriced")
        || msg.contains("fee too low")
        || msg.contains("max fee per gas less than block base fee")
        || msg.contains("tip too low")
    {
        SendErrorClass::Underpriced
    } else if msg.contains("insufficient funds") {
        SendErrorClass::InsufficientFunds
    } else if msg.contains("intrinsic gas too low")
        || msg.contains("oversized data")
        || msg.contains("exceeds block gas limit")
        || msg.contains("invalid sender")
        || msg.contains("invalid chain id")
        || msg.contains("rlp")
    {
        SendErrorClass::Malformed
    } else {
        SendErrorClass::Transient
    }
}

/// Single verdict over every node's answer to one broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastVerdict {
    /// At least one node holds the attempt
    Accepted,
    Underpriced { message: String },
    NonceTooLow { message: String },
    Fatal(FatalReason),
    Transient { message: String },
}

/// Per-node outcome as persisted on the attempt.
pub fn send_outcome(result: &Result<(), RpcErrorKind>) -> SendOutcome {
    match result {
        Ok(()) => SendOutcome::Accepted,
        Err(error) => match classify_send_error(error) {
            SendErrorClass::AlreadyKnown => SendOutcome::AlreadyKnown,
            _ if error.is_error_resp() => SendOutcome::Rejected {
                message: error.to_string(),
            },
            _ => SendOutcome::Unreachable {
                message: error.to_string(),
            },
        },
    }
}

/// Folds per-node results into one verdict.
///
/// Acceptance by any node wins. Otherwise an underpriced rejection is preferred over
/// nonce-too-low, which is preferred over a fatal rejection. Everything else is transient.
pub fn aggregate(results: &[NodeSendResult]) -> (BroadcastVerdict, BTreeMap<String, SendOutcome>) {
    let outcomes: BTreeMap<String, SendOutcome> = results
        .iter()
        .map(|r| (r.node.clone(), send_outcome(&r.result)))
        .collect();

    if outcomes.values().any(SendOutcome::is_accepted) {
        return (BroadcastVerdict::Accepted, outcomes);
    }

    let mut underpriced = None;
    let mut nonce_too_low = None;
    let mut fatal = None;
    let mut transient = None;

    for result in results {
        let Err(error) = &result.result else {
            continue;
        };
        let message = format!("{}: {error}", result.node);

        match classify_send_error(error) {
            SendErrorClass::Underpriced => {
                underpriced.get_or_insert(message);
            }
            SendErrorClass::NonceTooLow => {
                nonce_too_low.get_or_insert(message);
            }
            SendErrorClass::InsufficientFunds => {
                fatal.get_or_insert(FatalReason::InsufficientFunds { message });
            }
            SendErrorClass::Malformed => {
                fatal.get_or_insert(FatalReason::Malformed { message });
            }
            SendErrorClass::AlreadyKnown => {}
            SendErrorClass::NonceTooHigh | SendErrorClass::Transient => {
                transient.get_or_insert(message);
            }
        }
    }

    let verdict = if let Some(message) = underpriced {
        BroadcastVerdict::Underpriced { message }
    } else if let Some(message) = nonce_too_low {
        BroadcastVerdict::NonceTooLow { message }
    } else if let Some(reason) = fatal {
        BroadcastVerdict::Fatal(reason)
    } else {
        BroadcastVerdict::Transient {
            message: transient.unwrap_or_else(|| "no node answered".to_string()),
        }
    };

    (verdict, outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use txm_core::error::RpcErrorResponse;

    fn rejected(node: &str, message: &str) -> NodeSendResult {
        NodeSendResult {
            node: node.to_string(),
            result: Err(RpcErrorKind::ErrorResp(RpcErrorResponse {
                code: -32000,
                message: message.to_string(),
                data: None,
            })),
        }
    }

    fn unreachable(node: &str) -> NodeSendResult {
        NodeSendResult {
            node: node.to_string(),
            result: Err(RpcErrorKind::TransportHttpError {
                status: 502,
                body: "bad gateway".to_string(),
            }),
        }
    }

    fn accepted(node: &str) -> NodeSendResult {
        NodeSendResult {
            node: node.to_string(),
            result: Ok(()),
        }
    }

    #[test]
    fn classifies_common_node_messages() {
        let cases = [
            ("nonce too low: next nonce 5, tx nonce 4", SendErrorClass::NonceTooLow),
            ("already known", SendErrorClass::AlreadyKnown),
            ("replacement transaction underpriced", SendErrorClass::Underpriced),
            ("transaction underpriced", SendErrorClass::Underpriced),
            (
                "insufficient funds for gas * price + value",
                SendErrorClass::InsufficientFunds,
            ),
            ("intrinsic gas too low", SendErrorClass::Malformed),
            ("oversized data", SendErrorClass::Malformed),
            ("nonce too high", SendErrorClass::NonceTooHigh),
            ("header not found", SendErrorClass::Transient),
        ];

        for (message, expected) in cases {
            let error = rejected("n", message).result.unwrap_err();
            assert_eq!(classify_send_error(&error), expected, "{message}");
        }
    }

    #[test]
    fn transport_errors_are_transient() {
        let error = unreachable("n").result.unwrap_err();
        assert_eq!(classify_send_error(&error), SendErrorClass::Transient);
    }

    #[test]
    fn any_acceptance_wins() {
        let (verdict, outcomes) = aggregate(&[
            rejected("a", "insufficient funds for gas * price + value"),
            accepted("b"),
            rejected("c", "already known"),
        ]);

        assert_eq!(verdict, BroadcastVerdict::Accepted);
        assert_eq!(outcomes["b"], SendOutcome::Accepted);
        assert_eq!(outcomes["c"], SendOutcome::AlreadyKnown);
        assert!(matches!(outcomes["a"], SendOutcome::Rejected { .. }));
    }

    #[test]
    fn already_known_alone_counts_as_accepted() {
        let (verdict, _) = aggregate(&[rejected("a", "already known"), unreachable("b")]);
        assert_eq!(verdict, BroadcastVerdict::Accepted);
    }

    #[test]
    fn underpriced_beats_nonce_too_low_beats_fatal() {
        let (verdict, _) = aggregate(&[
            rejected("a", "insufficient funds"),
            rejected("b", "nonce too low"),
            rejected("c", "replacement transaction underpriced"),
        ]);
        assert!(matches!(verdict, BroadcastVerdict::Underpriced { .. }));

        let (verdict, _) = aggregate(&[
            rejected("a", "insufficient funds"),
            rejected("b", "nonce too low"),
        ]);
        assert!(matches!(verdict, BroadcastVerdict::NonceTooLow { .. }));

        let (verdict, _) = aggregate(&[rejected("a", "insufficient funds"), unreachable("b")]);
        assert!(matches!(
            verdict,
            BroadcastVerdict::Fatal(FatalReason::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn no_nodes_is_transient() {
        let (verdict, outcomes) = aggregate(&[]);
        assert!(matches!(verdict, BroadcastVerdict::Transient { .. }));
        assert!(outcomes.is_empty());
    }
}
