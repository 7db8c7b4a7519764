use std::str::FromStr as _;

use rust_decimal::Decimal;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use super::ledger::{CreateExchangeInput, ExchangeLedger};
use super::{ExchangeRequest, ExchangeStatus, OutputAddress};
use crate::chain::PaymentStatus;
use crate::proto::v1 as pb;

#[derive(Clone)]
pub struct ExchangeServiceImpl {
    ledger: ExchangeLedger,
}

impl ExchangeServiceImpl {
    pub fn new(ledger: ExchangeLedger) -> Self {
        Self { ledger }
    }

    fn record_to_proto(record: &ExchangeRequest) -> pb::Exchange {
        let status = match record.status {
            ExchangeStatus::Pending => pb::ExchangeStatus::Pending,
            ExchangeStatus::Waiting => pb::ExchangeStatus::Waiting,
            ExchangeStatus::Processing => pb::ExchangeStatus::Processing,
            ExchangeStatus::Completed => pb::ExchangeStatus::Completed,
            ExchangeStatus::Failed => pb::ExchangeStatus::Failed,
            ExchangeStatus::Expired => pb::ExchangeStatus::Expired,
        };

        pb::Exchange {
            id: record.id.to_string(),
            payment_address: record.payment_address.clone(),
            btc_amount: record.btc_amount.to_string(),
            output_currency: record.output_currency.symbol().to_string(),
            output_addresses: record
                .output_addresses
                .iter()
                .map(|o| pb::OutputAddress {
                    address: o.address.clone(),
                    percentage: o.percentage.to_string(),
                })
                .collect(),
            estimated_output: record.estimated_output.to_string(),
            final_output: record.final_output.map(|v| v.to_string()),
            fee: record.fee.to_string(),
            status: status as i32,
            created_at_ms: record.created_at.timestamp_millis(),
            updated_at_ms: record.updated_at.timestamp_millis(),
        }
    }

    fn payment_to_proto(status: PaymentStatus) -> pb::PaymentStatus {
        pb::PaymentStatus {
            address: status.address,
            expected_amount: status.expected_sats,
            total_received: status.total_received_sats,
            confirmed_balance: status.confirmed_sats,
            unconfirmed_balance: status.unconfirmed_sats,
            status: status.classification.as_str().to_string(),
            confirmations: status.confirmations,
            payment_txid: status.txid,
        }
    }
}

fn parse_id(id: &str) -> Result<Uuid, Status> {
    if id.trim().is_empty() {
        return Err(Status::invalid_argument("id is required"));
    }
    Uuid::parse_str(id.trim()).map_err(|e| Status::invalid_argument(format!("invalid id: {e}")))
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, Status> {
    Decimal::from_str(value.trim())
        .map_err(|e| Status::invalid_argument(format!("invalid {field} {value:?}: {e}")))
}

#[tonic::async_trait]
impl pb::exchange_service_server::ExchangeService for ExchangeServiceImpl {
    async fn create_exchange(
        &self,
        request: Request<pb::CreateExchangeRequest>,
    ) -> Result<Response<pb::Exchange>, Status> {
        let req = request.into_inner();

        let btc_amount = parse_decimal("btc_amount", &req.btc_amount)?;
        let output_addresses = req
            .output_addresses
            .into_iter()
            .map(|o| {
                Ok(OutputAddress {
                    percentage: parse_decimal("percentage", &o.percentage)?,
                    address: o.address,
                })
            })
            .collect::<Result<Vec<_>, Status>>()?;

        let record = self
            .ledger
            .create_request(CreateExchangeInput {
                btc_amount,
                output_currency: req.output_currency,
                output_addresses,
            })
            .await?;

        Ok(Response::new(Self::record_to_proto(&record)))
    }

    async fn get_exchange(
        &self,
        request: Request<pb::GetExchangeRequest>,
    ) -> Result<Response<pb::Exchange>, Status> {
        let id = parse_id(&request.into_inner().id)?;
        let record = self.ledger.get_request(id)?;
        Ok(Response::new(Self::record_to_proto(&record)))
    }

    async fn list_exchanges(
        &self,
        request: Request<pb::ListExchangesRequest>,
    ) -> Result<Response<pb::ListExchangesResponse>, Status> {
        let req = request.into_inner();
        let records = self.ledger.list_requests(req.limit, req.offset)?;
        Ok(Response::new(pb::ListExchangesResponse {
            exchanges: records.iter().map(Self::record_to_proto).collect(),
        }))
    }

    async fn get_payment_status(
        &self,
        request: Request<pb::GetPaymentStatusRequest>,
    ) -> Result<Response<pb::PaymentStatus>, Status> {
        let id = parse_id(&request.into_inner().id)?;
        let status = self.ledger.payment_status(id).await?;
        Ok(Response::new(Self::payment_to_proto(status)))
    }

    async fn get_prices(
        &self,
        _request: Request<pb::GetPricesRequest>,
    ) -> Result<Response<pb::Prices>, Status> {
        let prices = self.ledger.prices().get_prices().await?;
        Ok(Response::new(pb::Prices {
            usd: prices
                .into_iter()
                .map(|(asset, price)| (asset.symbol().to_string(), price.to_string()))
                .collect(),
        }))
    }

    async fn list_supported_assets(
        &self,
        _request: Request<pb::ListSupportedAssetsRequest>,
    ) -> Result<Response<pb::SupportedAssets>, Status> {
        let assets = self
            .ledger
            .supported_assets()
            .into_iter()
            .map(|info| pb::SupportedAsset {
                symbol: info.asset.symbol().to_string(),
                name: info.name.to_string(),
                min_amount: info.min_amount.to_string(),
                max_amount: info.max_amount.to_string(),
                fee_rate: info.fee_rate.to_string(),
            })
            .collect();
        Ok(Response::new(pb::SupportedAssets { assets }))
    }
}
