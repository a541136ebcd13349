//! Market data inputs: the OHLCV candle source and current-price lookup

mod candle_source;

pub use candle_source::{
    parse_dexscreener_price, parse_gecko_pool_price, parse_ohlcv_list, CandleSource,
    GeckoTerminalSource,
};
