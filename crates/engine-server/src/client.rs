//! One ingress connection: length-prefixed request frames in, exactly one
//! response frame out per request, in order.

use std::sync::Arc;

use bytes::BytesMut;
use engine_core::ErrorCode;
use engine_funds::FundsOperation;
use engine_protocol::{
    decode_request, encode_response, read_frame, write_frame, BalanceEntry, BalanceOp, BalanceOpKind, Request,
    Response,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::error::{ClientError, QueueError};
use crate::order_queue::OrderQueue;
use crate::types::{shutdown_requested, ClientId, ShutdownRx};

/// Run the request loop for a single connection until the peer closes it
/// or shutdown starts.
pub(crate) async fn run_client(
    client_id: ClientId,
    mut stream: TcpStream,
    queue: Arc<OrderQueue>,
    mut shutdown: ShutdownRx,
) -> Result<(), ClientError> {
    let mut inbound = BytesMut::with_capacity(4096);
    let mut payload = BytesMut::with_capacity(256);
    let mut outbound = BytesMut::with_capacity(256);

    loop {
        while let Some(frame) = read_frame(&mut inbound)? {
            let response = match decode_request(&frame) {
                Ok(request) => {
                    trace!(client = client_id.0, ?request, "request");
                    dispatch(&queue, request).await
                }
                Err(err) => {
                    warn!(client = client_id.0, error = %err, "undecodable request");
                    Response::Rejected {
                        code: ErrorCode::InvalidOrder,
                        order_id: 0,
                        message: err.to_string(),
                    }
                }
            };
            payload.clear();
            encode_response(&response, &mut payload)?;
            outbound.clear();
            write_frame(&payload, &mut outbound)?;
            stream.write_all(&outbound).await?;
        }

        tokio::select! {
            read = stream.read_buf(&mut inbound) => {
                if read? == 0 {
                    debug!(client = client_id.0, "peer closed");
                    return Ok(());
                }
            }
            _ = shutdown_requested(&mut shutdown) => {
                debug!(client = client_id.0, "closing for shutdown");
                return Ok(());
            }
        }
    }
}

async fn dispatch(queue: &OrderQueue, request: Request) -> Response {
    match request {
        Request::SubmitOrder(order) => {
            let order_id = order.id;
            match queue.submit(order).await {
                Ok(order_id) => Response::Accepted { order_id },
                Err(err) => rejected(order_id, &err),
            }
        }
        Request::CancelOrder {
            market_id,
            order_id,
            owner_id,
        } => match queue.cancel(&market_id, order_id, owner_id).await {
            Ok(outcome) => Response::CancelResult { order_id, outcome },
            Err(err) => rejected(order_id, &err),
        },
        Request::GetBalances {
            user_id,
            sub_account_id,
        } => match queue.balances(user_id, sub_account_id) {
            Ok(rows) => Response::Balances {
                user_id,
                sub_account_id,
                balances: rows
                    .into_iter()
                    .map(|(coin, b)| BalanceEntry {
                        coin,
                        available: b.available,
                        locked: b.locked,
                        in_orders: b.in_orders,
                    })
                    .collect(),
            },
            Err(err) => rejected(0, &QueueError::Funds(err)),
        },
        Request::BalanceOp(op) => match queue.apply_funds(&funds_operation(op)) {
            Ok(()) => Response::Accepted { order_id: 0 },
            Err(err) => rejected(0, &QueueError::Funds(err)),
        },
    }
}

fn rejected(order_id: u64, err: &QueueError) -> Response {
    debug!(order = order_id, code = %err.code(), error = %err, "request rejected");
    Response::Rejected {
        code: err.code(),
        order_id,
        message: err.to_string(),
    }
}

fn funds_operation(op: BalanceOp) -> FundsOperation {
    let BalanceOp {
        kind,
        user_id,
        sub_account_id,
        coin,
        amount,
        fee,
    } = op;
    match kind {
        BalanceOpKind::NewDeposit => FundsOperation::NewDeposit {
            user_id,
            sub_account_id,
            coin,
            amount,
        },
        BalanceOpKind::ConfirmDeposit => FundsOperation::ConfirmDeposit {
            user_id,
            sub_account_id,
            coin,
            amount,
        },
        BalanceOpKind::NewManualWithdraw => FundsOperation::NewManualWithdraw {
            user_id,
            sub_account_id,
            coin,
            amount,
        },
        BalanceOpKind::NewWithdraw => FundsOperation::NewWithdraw {
            user_id,
            sub_account_id,
            coin,
            amount,
            fee,
        },
        BalanceOpKind::ConfirmWithdraw => FundsOperation::ConfirmWithdraw {
            user_id,
            sub_account_id,
            coin,
            amount,
        },
        BalanceOpKind::RevertWithdraw => FundsOperation::RevertWithdraw {
            user_id,
            sub_account_id,
            coin,
            amount,
            fee,
        },
    }
}
