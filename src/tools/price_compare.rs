//! compare_prices：按预算划分商家
//!
//! 每个输入商家恰好落入 within_budget / above_budget / no_price_info 之一。
//! 无预算时所有有报价的商家都计入 within_budget；报价为 0 或非数字视为无报价。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::{Tool, COMPARE_PRICES_TOOL};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedPlace {
    pub name: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceComparison {
    pub within_budget: Vec<PricedPlace>,
    pub above_budget: Vec<PricedPlace>,
    pub no_price_info: Vec<String>,
    pub average_price: Option<f64>,
}

impl PriceComparison {
    /// 商家的预算判定：Some(true) 预算内，Some(false) 超预算，None 无报价或不在结果中
    pub fn budget_fit(&self, name: &str) -> Option<bool> {
        if self.within_budget.iter().any(|p| p.name == name) {
            Some(true)
        } else if self.above_budget.iter().any(|p| p.name == name) {
            Some(false)
        } else {
            None
        }
    }
}

/// 读取商家报价：pricing_info.monthly → pricing_info.base → price
fn place_price(place: &Value) -> Option<f64> {
    let from_info = place.get("pricing_info").and_then(|info| {
        info.get("monthly")
            .and_then(Value::as_f64)
            .filter(|p| *p > 0.0)
            .or_else(|| info.get("base").and_then(Value::as_f64))
    });
    from_info
        .or_else(|| place.get("price").and_then(Value::as_f64))
        .filter(|p| *p > 0.0 && p.is_finite())
}

pub fn compare_prices(places: &[Value], budget: Option<f64>) -> PriceComparison {
    let mut analysis = PriceComparison::default();
    let mut prices = Vec::new();

    for place in places {
        let name = place
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        match place_price(place) {
            Some(price) => {
                prices.push(price);
                let priced = PricedPlace { name, price };
                match budget {
                    Some(b) if price > b => analysis.above_budget.push(priced),
                    _ => analysis.within_budget.push(priced),
                }
            }
            None => analysis.no_price_info.push(name),
        }
    }

    if !prices.is_empty() {
        analysis.average_price = Some(prices.iter().sum::<f64>() / prices.len() as f64);
    }
    analysis
}

#[derive(Debug, Deserialize)]
struct ComparePricesArgs {
    places: Vec<Value>,
    #[serde(default)]
    budget: Option<f64>,
}

pub struct PriceCompareTool;

#[async_trait]
impl Tool for PriceCompareTool {
    fn name(&self) -> &str {
        COMPARE_PRICES_TOOL
    }

    fn description(&self) -> &str {
        "Partition places by budget. Args: {\"places\": [{\"name\", \"pricing_info\": {\"monthly\"}}], \"budget\": optional}."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "places": {"type": "array"},
                "budget": {"type": "number"}
            },
            "required": ["places"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: ComparePricesArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid args: {e}"))?;
        serde_json::to_value(compare_prices(&args.places, args.budget)).map_err(|e| e.to_string())
    }
}
