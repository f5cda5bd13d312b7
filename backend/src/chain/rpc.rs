use alloy::{
    primitives::{Address, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    sol,
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use futures::future;
use std::str::FromStr;
use tracing::{debug, info};

use super::{ChainError, PairInfo, PairShape, PairSource, TokenMetadata, TokenProbe};

// Uniswap V2 factory / pair ABI and ERC20 metadata
sol! {
    #[sol(rpc)]
    interface IUniswapV2Factory {
        function allPairsLength() external view returns (uint256);
        function allPairs(uint256 index) external view returns (address);
    }

    #[sol(rpc)]
    interface IUniswapV2Pair {
        function token0() external view returns (address);
        function token1() external view returns (address);
    }

    #[sol(rpc)]
    interface IERC20Metadata {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }
}

/// Chain client for one network: enumerates a V2-style factory and probes
/// token contracts over a single HTTP provider.
#[derive(Clone)]
pub struct RpcChainClient {
    provider: RootProvider<Http<Client>>,
    factory: Address,
}

impl RpcChainClient {
    pub fn connect(rpc_url: &str, factory_address: &str) -> Result<Self, ChainError> {
        let parsed_url = rpc_url
            .parse()
            .map_err(|e| ChainError::InvalidUrl(format!("{}: {}", rpc_url, e)))?;
        let factory = Address::from_str(factory_address)
            .map_err(|e| ChainError::InvalidUrl(format!("invalid factory address {}: {}", factory_address, e)))?;

        let provider = ProviderBuilder::new().on_http(parsed_url);
        info!("Connected chain client to {} (factory {})", rpc_url, factory);

        Ok(Self { provider, factory })
    }

    async fn pair_at(&self, index: u64) -> Result<Option<PairInfo>, ChainError> {
        let factory = IUniswapV2Factory::new(self.factory, &self.provider);
        let pair = match factory.allPairs(U256::from(index)).call().await {
            Ok(result) => result._0,
            Err(e) => {
                return match ChainError::from_call(self.factory, "allPairs", e) {
                    ChainError::Reverted { .. } => Ok(None),
                    other => Err(other),
                }
            }
        };
        if pair == Address::ZERO {
            return Ok(None);
        }

        match self.pair_shape(pair).await? {
            PairShape::Composite { token0, token1 } => Ok(Some(PairInfo { pair, token0, token1 })),
            PairShape::Single => {
                debug!("Factory index {} resolved to {} without constituents", index, pair);
                Ok(None)
            }
        }
    }

    async fn constituent(&self, address: Address, first: bool) -> Result<Address, ChainError> {
        let pair = IUniswapV2Pair::new(address, &self.provider);
        if first {
            pair.token0()
                .call()
                .await
                .map(|r| r._0)
                .map_err(|e| ChainError::from_call(address, "token0", e))
        } else {
            pair.token1()
                .call()
                .await
                .map(|r| r._0)
                .map_err(|e| ChainError::from_call(address, "token1", e))
        }
    }
}

#[async_trait]
impl PairSource for RpcChainClient {
    async fn total_count(&self) -> Result<u64, ChainError> {
        let factory = IUniswapV2Factory::new(self.factory, &self.provider);
        let length = factory
            .allPairsLength()
            .call()
            .await
            .map_err(|e| ChainError::from_call(self.factory, "allPairsLength", e))?;
        Ok(length._0.saturating_to::<u64>())
    }

    async fn fetch_batch(&self, indices: &[u64]) -> Result<Vec<Option<PairInfo>>, ChainError> {
        let results = future::join_all(indices.iter().map(|&index| self.pair_at(index))).await;
        results.into_iter().collect()
    }
}

#[async_trait]
impl TokenProbe for RpcChainClient {
    async fn is_contract(&self, address: Address) -> Result<bool, ChainError> {
        let code = self
            .provider
            .get_code_at(address)
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(!code.is_empty())
    }

    async fn pair_shape(&self, address: Address) -> Result<PairShape, ChainError> {
        let (token0, token1) = future::join(self.constituent(address, true), self.constituent(address, false)).await;
        match (token0, token1) {
            (Ok(token0), Ok(token1)) if token0 == Address::ZERO && token1 == Address::ZERO => Ok(PairShape::Single),
            (Ok(token0), Ok(token1)) => Ok(PairShape::Composite { token0, token1 }),
            // Plain ERC20s revert on token0()/token1()
            (Err(ChainError::Reverted { .. }), Err(ChainError::Reverted { .. })) => Ok(PairShape::Single),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    async fn metadata(&self, address: Address) -> Result<TokenMetadata, ChainError> {
        let token = IERC20Metadata::new(address, &self.provider);
        let name = token
            .name()
            .call()
            .await
            .map_err(|e| ChainError::from_call(address, "name", e))?
            ._0;
        let symbol = token
            .symbol()
            .call()
            .await
            .map_err(|e| ChainError::from_call(address, "symbol", e))?
            ._0;
        let decimals = token
            .decimals()
            .call()
            .await
            .map_err(|e| ChainError::from_call(address, "decimals", e))?
            ._0;

        Ok(TokenMetadata::from_chain(&name, &symbol, decimals))
    }
}
