// Expression Module
// Gate conditions: the tagged expression tree, its text syntax and its evaluator

pub mod condition;
pub mod evaluator;
pub mod lexer;
pub mod parser;

pub use condition::{CompareOp, Condition};
pub use evaluator::{is_known_field, GateEvaluator};
pub use lexer::{LexError, Lexer, Token};
pub use parser::{ConditionParser, ParseConditionError, MAX_NESTING_DEPTH};
