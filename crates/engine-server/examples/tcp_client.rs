use std::env;
use std::io::{self, Write};
use std::str::FromStr;

use anyhow::{bail, Context};
use bytes::BytesMut;
use engine_core::{Decimal, Order, OrderType, Side};
use engine_protocol::{decode_response, encode_request, read_frame, write_frame, BalanceOp, BalanceOpKind, Request};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Where to connect: env override or default.
    let addr = env::var("ENGINE_CLIENT_ADDR").unwrap_or_else(|_| "127.0.0.1:9000".to_string());

    println!("Connecting to {}...", addr);
    let mut stream = TcpStream::connect(&addr).await?;
    println!("Connected.");
    println!("Commands:");
    println!("  deposit <user> <coin> <amount>      (new + confirm)");
    println!("  buy|sell <market> <id> <user> <price> <amount>");
    println!("  market-buy <market> <id> <user> <amount> <funds>");
    println!("  cancel <market> <id> <user>");
    println!("  balances <user>");
    println!("Type 'quit' or 'exit' to leave.\n");

    let stdin = io::stdin();
    let mut inbound = BytesMut::with_capacity(4096);

    loop {
        print!(">> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            println!("\nEOF on stdin, exiting client.");
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            println!("Exiting client.");
            break;
        }

        let requests = match parse(trimmed) {
            Ok(requests) => requests,
            Err(err) => {
                eprintln!("{err:#}");
                continue;
            }
        };
        for request in requests {
            let mut payload = BytesMut::new();
            encode_request(&request, &mut payload)?;
            let mut frame = BytesMut::new();
            write_frame(&payload, &mut frame)?;
            stream.write_all(&frame).await?;

            // exactly one response per request
            let response = loop {
                if let Some(frame) = read_frame(&mut inbound)? {
                    break decode_response(&frame)?;
                }
                if stream.read_buf(&mut inbound).await? == 0 {
                    bail!("server closed the connection");
                }
            };
            println!("{response:?}");
        }
    }

    Ok(())
}

fn parse(line: &str) -> anyhow::Result<Vec<Request>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let requests = match parts.as_slice() {
        ["deposit", user, coin, amount] => {
            let user_id = num(user)?;
            let amount: Decimal = num(amount)?;
            [BalanceOpKind::NewDeposit, BalanceOpKind::ConfirmDeposit]
                .into_iter()
                .map(|kind| {
                    Request::BalanceOp(BalanceOp {
                        kind,
                        user_id,
                        sub_account_id: 0,
                        coin: coin.to_string(),
                        amount,
                        fee: Decimal::ZERO,
                    })
                })
                .collect()
        }
        [side @ ("buy" | "sell"), market, id, user, price, amount] => {
            let side = if *side == "buy" { Side::Buy } else { Side::Sell };
            let mut order = Order::new(num(id)?, *market, side, OrderType::Limit, num(price)?, num(amount)?);
            order.owner_id = num(user)?;
            vec![Request::SubmitOrder(order)]
        }
        ["market-buy", market, id, user, amount, funds] => {
            let mut order = Order::new(num(id)?, *market, Side::Buy, OrderType::Market, Decimal::ZERO, num(amount)?);
            order.owner_id = num(user)?;
            order.funds = num(funds)?;
            vec![Request::SubmitOrder(order)]
        }
        ["cancel", market, id, user] => vec![Request::CancelOrder {
            market_id: market.to_string(),
            order_id: num(id)?,
            owner_id: num(user)?,
        }],
        ["balances", user] => vec![Request::GetBalances {
            user_id: num(user)?,
            sub_account_id: 0,
        }],
        _ => bail!("could not parse {line:?}"),
    };
    Ok(requests)
}

fn num<T>(s: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse().with_context(|| format!("bad number {s:?}"))
}
