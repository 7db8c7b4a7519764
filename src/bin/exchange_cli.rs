use anyhow::{Context as _, Result};
use btc_split_exchange::proto::v1::exchange_service_client::ExchangeServiceClient;
use btc_split_exchange::proto::v1::{
    CreateExchangeRequest, Exchange, ExchangeStatus, GetExchangeRequest, GetPaymentStatusRequest,
    GetPricesRequest, ListExchangesRequest, ListSupportedAssetsRequest, OutputAddress,
};
use clap::{Parser as _, Subcommand};
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "BTC_EXCHANGE_GRPC_URL", default_value = "http://127.0.0.1:50051")]
    grpc_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    CreateExchange {
        #[arg(long)]
        btc_amount: String,

        #[arg(long)]
        output_currency: String,

        /// Destination as `ADDRESS=PERCENT`. Repeat for a split.
        #[arg(long = "output", value_parser = parse_output, required = true)]
        outputs: Vec<OutputAddress>,
    },
    GetExchange {
        #[arg(long)]
        id: String,
    },
    ListExchanges {
        #[arg(long, default_value_t = 20)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    GetPaymentStatus {
        #[arg(long)]
        id: String,
    },
    GetPrices,
    ListSupportedAssets,
}

fn parse_output(s: &str) -> Result<OutputAddress, String> {
    let (address, percentage) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected ADDRESS=PERCENT, got {s:?}"))?;
    Ok(OutputAddress {
        address: address.to_string(),
        percentage: percentage.to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    btc_split_exchange::logging::init().ok();
    let args = Args::parse();

    let mut client = ExchangeServiceClient::connect(args.grpc_url)
        .await
        .context("connect gRPC")?;

    let out = match args.command {
        Command::CreateExchange {
            btc_amount,
            output_currency,
            outputs,
        } => {
            let exchange = client
                .create_exchange(CreateExchangeRequest {
                    btc_amount,
                    output_currency,
                    output_addresses: outputs,
                })
                .await
                .context("CreateExchange")?
                .into_inner();

            exchange_json(exchange)
        }
        Command::GetExchange { id } => {
            let exchange = client
                .get_exchange(GetExchangeRequest { id })
                .await
                .context("GetExchange")?
                .into_inner();

            exchange_json(exchange)
        }
        Command::ListExchanges { limit, offset } => {
            let resp = client
                .list_exchanges(ListExchangesRequest { limit, offset })
                .await
                .context("ListExchanges")?
                .into_inner();

            json!(resp.exchanges.into_iter().map(exchange_json).collect::<Vec<_>>())
        }
        Command::GetPaymentStatus { id } => {
            let status = client
                .get_payment_status(GetPaymentStatusRequest { id })
                .await
                .context("GetPaymentStatus")?
                .into_inner();

            json!({
              "address": status.address,
              "expected_amount": status.expected_amount,
              "total_received": status.total_received,
              "confirmed_balance": status.confirmed_balance,
              "unconfirmed_balance": status.unconfirmed_balance,
              "status": status.status,
              "confirmations": status.confirmations,
              "payment_txid": status.payment_txid,
            })
        }
        Command::GetPrices => {
            let prices = client
                .get_prices(GetPricesRequest {})
                .await
                .context("GetPrices")?
                .into_inner();

            let usd: std::collections::BTreeMap<_, _> = prices.usd.into_iter().collect();
            json!({ "usd": usd })
        }
        Command::ListSupportedAssets => {
            let resp = client
                .list_supported_assets(ListSupportedAssetsRequest {})
                .await
                .context("ListSupportedAssets")?
                .into_inner();

            json!(
                resp.assets
                    .into_iter()
                    .map(|a| json!({
                      "symbol": a.symbol,
                      "name": a.name,
                      "min_amount": a.min_amount,
                      "max_amount": a.max_amount,
                      "fee_rate": a.fee_rate,
                    }))
                    .collect::<Vec<_>>()
            )
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn exchange_json(exchange: Exchange) -> serde_json::Value {
    let status_str = ExchangeStatus::try_from(exchange.status)
        .ok()
        .map(|s| {
            s.as_str_name()
                .trim_start_matches("EXCHANGE_STATUS_")
                .to_ascii_lowercase()
        })
        .unwrap_or_else(|| format!("unknown({})", exchange.status));

    json!({
      "id": exchange.id,
      "status": status_str,
      "payment_address": exchange.payment_address,
      "btc_amount": exchange.btc_amount,
      "output_currency": exchange.output_currency,
      "output_addresses": exchange.output_addresses.into_iter().map(|o| json!({
        "address": o.address,
        "percentage": o.percentage,
      })).collect::<Vec<_>>(),
      "estimated_output": exchange.estimated_output,
      "final_output": exchange.final_output,
      "fee": exchange.fee,
      "created_at_ms": exchange.created_at_ms,
      "updated_at_ms": exchange.updated_at_ms,
    })
}
