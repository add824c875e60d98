mod mock_odds;
mod simulation;
