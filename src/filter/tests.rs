//! Selector filter tests

use pretty_assertions::assert_eq;
use test_case::test_case;

use super::*;

fn props() -> Properties {
    let mut p = Properties::new();
    p.insert("animal", "goat");
    p.insert("legs", 4);
    p.insert("weight", 61.5);
    p.insert("count", 10i64);
    p.insert("tame", true);
    p.insert("motto", "100% goat");
    p
}

#[test_case("animal = 'goat'", true ; "string equality")]
#[test_case("animal = 'monkey'", false ; "string inequality")]
#[test_case("animal <> 'monkey'", true ; "not equal")]
#[test_case("animal != 'monkey'", true ; "bang equal")]
#[test_case("legs = 4", true ; "int equality")]
#[test_case("legs > 2 AND legs < 10", true ; "range with and")]
#[test_case("legs >= 5 OR tame = TRUE", true ; "or short circuit")]
#[test_case("weight > 60", true ; "float against int")]
#[test_case("legs * 2 = 8", true ; "arithmetic")]
#[test_case("count - legs = 6", true ; "long minus int")]
#[test_case("-legs < 0", true ; "negation")]
#[test_case("NOT (animal = 'goat')", false ; "not")]
#[test_case("legs BETWEEN 2 AND 4", true ; "between inclusive")]
#[test_case("legs NOT BETWEEN 5 AND 8", true ; "not between")]
#[test_case("animal IN ('cow', 'goat')", true ; "in list")]
#[test_case("animal NOT IN ('cow', 'goat')", false ; "not in list")]
#[test_case("animal LIKE 'go%'", true ; "like prefix")]
#[test_case("animal LIKE 'g_at'", true ; "like single char")]
#[test_case("animal NOT LIKE '%oa%'", false ; "not like")]
#[test_case("motto LIKE '100\\% %' ESCAPE '\\'", true ; "like escape")]
#[test_case("animal LIKE 'g.*'", false ; "like is not regex")]
#[test_case("colour IS NULL", true ; "is null")]
#[test_case("animal IS NOT NULL", true ; "is not null")]
#[test_case("tame", true ; "bare boolean property")]
#[test_case("ANIMAL = 'goat'", false ; "property names are case sensitive")]
#[test_case("animal = 'goat' and legs = 4", true ; "keywords are case insensitive")]
fn test_evaluate(expression: &str, expected: bool) {
    let filter = SelectorFilter::new(expression).unwrap();
    assert_eq!(filter.evaluate(&props()), expected);
}

#[test_case("colour = 'red'" ; "missing property compares unknown")]
#[test_case("NOT (colour = 'red')" ; "not unknown stays unknown")]
#[test_case("colour = 'red' OR legs = 5" ; "unknown or false")]
#[test_case("animal = 4" ; "type mismatch")]
#[test_case("colour IN ('red')" ; "null in list")]
#[test_case("legs / 0 = 1" ; "division by zero")]
fn test_unknown_is_not_a_match(expression: &str) {
    let filter = SelectorFilter::new(expression).unwrap();
    assert!(!filter.evaluate(&props()));
}

#[test]
fn test_unknown_and_false_is_false() {
    // UNKNOWN AND FALSE is FALSE, so its negation matches
    let filter = SelectorFilter::new("NOT (colour = 'red' AND legs = 5)").unwrap();
    assert!(filter.evaluate(&props()));
}

#[test]
fn test_unknown_or_true_is_true() {
    let filter = SelectorFilter::new("colour = 'red' OR legs = 4").unwrap();
    assert!(filter.evaluate(&props()));
}

#[test]
fn test_quoted_quote() {
    let mut p = Properties::new();
    p.insert("name", "o'neil");
    let filter = SelectorFilter::new("name = 'o''neil'").unwrap();
    assert!(filter.evaluate(&p));
}

#[test]
fn test_operator_precedence() {
    // AND binds tighter than OR
    let filter = SelectorFilter::new("legs = 5 AND legs = 5 OR animal = 'goat'").unwrap();
    assert!(filter.evaluate(&props()));
    let filter = SelectorFilter::new("legs = 5 AND (legs = 5 OR animal = 'goat')").unwrap();
    assert!(!filter.evaluate(&props()));
    assert_eq!(
        parse("1 + 2 * 3 = 7").unwrap(),
        Expr::Compare(
            CompareOp::Eq,
            Box::new(Expr::Arith(
                ArithOp::Add,
                Box::new(Expr::Literal(Literal::Int(1))),
                Box::new(Expr::Arith(
                    ArithOp::Mul,
                    Box::new(Expr::Literal(Literal::Int(2))),
                    Box::new(Expr::Literal(Literal::Int(3))),
                )),
            )),
            Box::new(Expr::Literal(Literal::Int(7))),
        )
    );
}

#[test_case("" ; "empty")]
#[test_case("animal =" ; "missing operand")]
#[test_case("animal = 'goat" ; "unterminated string")]
#[test_case("(animal = 'goat'" ; "unbalanced paren")]
#[test_case("animal = 'goat')" ; "trailing paren")]
#[test_case("animal NOT 'goat'" ; "dangling not")]
#[test_case("animal IN ()" ; "empty in list")]
#[test_case("animal LIKE 5" ; "like needs string")]
#[test_case("legs IS 4" ; "is needs null")]
#[test_case("animal # 'goat'" ; "unknown character")]
fn test_syntax_errors(expression: &str) {
    assert!(SelectorFilter::new(expression).is_err());
}

#[test]
fn test_error_position() {
    let err = SelectorFilter::new("animal = 'goat' AND #").unwrap_err();
    assert_eq!(err.position, 20);
    assert!(err.to_string().contains("position 20"));
}

#[test]
fn test_from_expression() {
    assert!(from_expression(None).unwrap().is_none());
    assert!(from_expression(Some("  ")).unwrap().is_none());
    let filter = from_expression(Some("animal='goat'")).unwrap().unwrap();
    assert_eq!(filter.expression(), "animal='goat'");
    assert!(from_expression(Some("animal=")).is_err());
}
