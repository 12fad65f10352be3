use crate::filters::filter_catalog;
use crate::strategy::STRATEGY_NAMES;

pub fn run() {
    println!("Strategies:");
    for name in STRATEGY_NAMES {
        println!("  {}", name);
    }
    println!();
    println!("Filters:");
    for filter in filter_catalog() {
        println!("  {:<22} {}", filter.name, filter.description);
        if !filter.required.is_empty() {
            println!("  {:<22} required: {}", "", filter.required.join(", "));
        }
        if !filter.optional.is_empty() {
            println!("  {:<22} optional: {}", "", filter.optional.join(", "));
        }
    }
}
